use anyhow::{bail, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

use super::{AppConfig, IdentityConfig, ReconnectConfig, SshdConfig, TunnelConfig};
use crate::tunnel::ReconnectMode;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证路径不为空
    pub fn validate_path(path: &Path, context: &str) -> Result<()> {
        if path.as_os_str().is_empty() {
            bail!("{}: path cannot be empty", context);
        }
        Ok(())
    }

    /// 验证 host:port 形式的目标地址
    pub fn validate_target(target: &str) -> Result<()> {
        Self::validate_address(target, "tunnel.target")?;
        let Some((host, port)) = target.rsplit_once(':') else {
            bail!("tunnel.target must be host:port (got '{}')", target);
        };
        if host.trim().is_empty() {
            bail!("tunnel.target has an empty host (got '{}')", target);
        }
        match port.parse::<u16>() {
            Ok(p) => Self::validate_port(p, "tunnel.target"),
            Err(_) => bail!("tunnel.target has an invalid port (got '{}')", target),
        }
    }

    /// 验证完整配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        if config.router.id == 0 {
            bail!("router.id must be greater than 0");
        }
        Self::validate_identity_config(&config.identity)?;
        Self::validate_sshd_config(&config.sshd)?;
        Self::validate_tunnel_config(&config.tunnel)?;
        Ok(())
    }

    /// 验证密钥配置
    pub fn validate_identity_config(config: &IdentityConfig) -> Result<()> {
        Self::validate_path(&config.private_key_path, "identity.private_key_path")?;
        Self::validate_path(&config.trust_anchor_path, "identity.trust_anchor_path")?;
        if let Some(ref cert) = config.certificate_path {
            Self::validate_path(cert, "identity.certificate_path")?;
        }
        Ok(())
    }

    /// 验证 SSH 服务端配置
    pub fn validate_sshd_config(config: &SshdConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "sshd.bind_addr")?;
        if config.inactivity_timeout_secs == 0 {
            warn!("sshd.inactivity_timeout_secs is 0, idle sessions will never time out");
        }
        Ok(())
    }

    /// 验证隧道配置（未启用时只检查格式无关的部分）
    pub fn validate_tunnel_config(config: &TunnelConfig) -> Result<()> {
        let mut seen = HashSet::new();
        for &port in &config.ports {
            Self::validate_port(port, "tunnel.ports")?;
            if !seen.insert(port) {
                bail!("tunnel.ports contains duplicate port {}", port);
            }
        }

        Self::validate_reconnect_config(&config.reconnect)?;

        if !config.enabled {
            return Ok(());
        }

        Self::validate_target(&config.target)?;
        if config.username.trim().is_empty() {
            bail!("tunnel.username cannot be empty when the tunnel is enabled");
        }
        if config.ports.is_empty() && !config.expose_sshd {
            bail!("tunnel is enabled but exposes no ports (set tunnel.ports or tunnel.expose_sshd)");
        }
        Ok(())
    }

    /// 验证重连策略
    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<()> {
        if config.mode != ReconnectMode::Backoff {
            return Ok(());
        }
        if config.initial_delay_secs == 0 {
            bail!("tunnel.reconnect.initial_delay_secs must be greater than 0");
        }
        if config.max_delay_secs < config.initial_delay_secs {
            bail!(
                "tunnel.reconnect.max_delay_secs ({}) cannot be less than initial_delay_secs ({})",
                config.max_delay_secs,
                config.initial_delay_secs
            );
        }
        Ok(())
    }
}
