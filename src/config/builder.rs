use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{
    random_router_id, validator::ConfigValidator, AppConfig, IdentityConfig, ReconnectConfig,
    RouterConfig, SshdConfig, TunnelConfig,
};
use crate::relay::RelayMode;

/// AppConfig Builder
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    router_id: Option<u32>,
    private_key_path: Option<PathBuf>,
    certificate_path: Option<PathBuf>,
    trust_anchor_path: Option<PathBuf>,
    sshd: SshdConfig,
    tunnel: TunnelConfig,
}

impl AppConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置路由器 ID（不设置则随机）
    pub fn router_id(mut self, id: u32) -> Self {
        self.router_id = Some(id);
        self
    }

    /// 设置私钥路径
    pub fn private_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    /// 设置证书路径
    pub fn certificate_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate_path = Some(path.into());
        self
    }

    /// 设置信任锚路径
    pub fn trust_anchor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_anchor_path = Some(path.into());
        self
    }

    /// 设置 SSH 服务端监听地址
    pub fn sshd_bind(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.sshd.bind_addr = addr.into();
        self.sshd.port = port;
        self
    }

    /// 启用隧道
    pub fn tunnel(mut self, target: impl Into<String>, username: impl Into<String>) -> Self {
        self.tunnel.enabled = true;
        self.tunnel.target = target.into();
        self.tunnel.username = username.into();
        self
    }

    /// 添加暴露端口
    pub fn expose_port(mut self, port: u16) -> Self {
        self.tunnel.ports.push(port);
        self
    }

    /// 设置是否暴露 SSH 服务端端口
    pub fn expose_sshd(mut self, expose: bool) -> Self {
        self.tunnel.expose_sshd = expose;
        self
    }

    /// 设置转发结束策略
    pub fn relay_mode(mut self, mode: RelayMode) -> Self {
        self.tunnel.relay_mode = mode;
        self
    }

    /// 设置重连策略
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.tunnel.reconnect = reconnect;
        self
    }

    /// 设置拨号失败与本地重试的等待时间（毫秒）
    pub fn delays_ms(mut self, dial_failure: u64, local_retry: u64) -> Self {
        self.tunnel.dial_failure_delay_ms = dial_failure;
        self.tunnel.local_retry_delay_ms = local_retry;
        self
    }

    /// 构建 AppConfig 并验证
    pub fn build(self) -> Result<AppConfig> {
        let config = AppConfig {
            router: RouterConfig {
                id: self.router_id.unwrap_or_else(random_router_id),
            },
            identity: IdentityConfig {
                private_key_path: self
                    .private_key_path
                    .context("private_key_path is required")?,
                certificate_path: self.certificate_path,
                trust_anchor_path: self
                    .trust_anchor_path
                    .context("trust_anchor_path is required")?,
            },
            sshd: self.sshd,
            tunnel: self.tunnel,
        };

        // 验证配置
        ConfigValidator::validate_app_config(&config)?;

        Ok(config)
    }
}
