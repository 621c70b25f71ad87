// 配置管理模块

mod builder;
mod validator;

pub use builder::AppConfigBuilder;
pub use validator::ConfigValidator;

use crate::relay::RelayMode;
use crate::sshd::SshServerConfig;
use crate::tunnel::{ForwarderOptions, ReconnectMode, ReconnectPolicy, TunnelOptions};
use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 环境变量覆盖前缀
pub const ENV_PREFIX: &str = "ROUTER_TUNNEL_";

/// 未配置时随机生成的路由器 ID 上限
pub const MAX_RANDOM_ROUTER_ID: u32 = 1000;

/// 路由器自身信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// 路由器 ID，显示在 shell 提示符中
    #[serde(default = "random_router_id")]
    pub id: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            id: random_router_id(),
        }
    }
}

/// 1..=1000 之间的随机 ID
pub fn random_router_id() -> u32 {
    rand::rng().random_range(1..=MAX_RANDOM_ROUTER_ID)
}

/// 密钥与信任锚文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// OpenSSH 私钥（同时作为 SSH 服务端主机密钥与隧道客户端身份）
    pub private_key_path: PathBuf,
    /// 私钥对应的 OpenSSH 证书（可选）
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    /// 信任锚公钥（authorized_keys 格式）
    pub trust_anchor_path: PathBuf,
}

/// 本地 SSH 服务端
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshdConfig {
    #[serde(default = "default_sshd_bind_addr")]
    pub bind_addr: String,
    /// 0 表示由系统分配
    #[serde(default)]
    pub port: u16,
    /// 空闲超时（秒），0 表示不超时
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

impl Default for SshdConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_sshd_bind_addr(),
            port: 0,
            inactivity_timeout_secs: default_inactivity_timeout(),
        }
    }
}

fn default_sshd_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_inactivity_timeout() -> u64 {
    3600
}

/// 重连策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub mode: ReconnectMode,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// 0 表示不限次数
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            mode: ReconnectMode::default(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: 0,
        }
    }
}

fn default_initial_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    60
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        match self.mode {
            ReconnectMode::Once => ReconnectPolicy::Once,
            ReconnectMode::Backoff => ReconnectPolicy::Backoff {
                initial: Duration::from_secs(self.initial_delay_secs),
                max: Duration::from_secs(self.max_delay_secs),
                max_attempts: self.max_attempts,
            },
        }
    }
}

/// 反向隧道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 汇合主机 host:port
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub username: String,
    /// 需要暴露的本地端口
    #[serde(default)]
    pub ports: Vec<u16>,
    /// 是否额外暴露本地 SSH 服务端的实际端口
    #[serde(default = "default_true")]
    pub expose_sshd: bool,
    #[serde(default = "default_delay_ms")]
    pub dial_failure_delay_ms: u64,
    #[serde(default = "default_delay_ms")]
    pub local_retry_delay_ms: u64,
    /// 拨号、认证、控制会话与远程监听请求的总时限（秒），0 表示不限
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_secs: u64,
    #[serde(default)]
    pub relay_mode: RelayMode,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: String::new(),
            username: String::new(),
            ports: Vec::new(),
            expose_sshd: true,
            dial_failure_delay_ms: default_delay_ms(),
            local_retry_delay_ms: default_delay_ms(),
            setup_timeout_secs: default_setup_timeout(),
            relay_mode: RelayMode::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_setup_timeout() -> u64 {
    30
}

fn default_delay_ms() -> u64 {
    1000
}

impl TunnelConfig {
    pub fn options(&self) -> TunnelOptions {
        TunnelOptions {
            dial_failure_delay: Duration::from_millis(self.dial_failure_delay_ms),
            setup_timeout: (self.setup_timeout_secs > 0)
                .then(|| Duration::from_secs(self.setup_timeout_secs)),
            forwarder: ForwarderOptions {
                retry_delay: Duration::from_millis(self.local_retry_delay_ms),
                relay_mode: self.relay_mode,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// 最终需要暴露的端口列表（去重，保持顺序）
    pub fn exposed_ports(&self, sshd_port: u16) -> Vec<u16> {
        let mut ports = Vec::with_capacity(self.ports.len() + 1);
        let extra = self.expose_sshd.then_some(sshd_port);
        for port in self.ports.iter().copied().chain(extra) {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub router: RouterConfig,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub sshd: SshdConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl AppConfig {
    /// 创建 Builder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::new()
    }

    /// 从 TOML 文本解析（不应用环境变量）
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: AppConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config.expand_paths();
        Ok(config)
    }

    /// 从文件加载，应用环境变量覆盖并验证
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_app_config(self)
    }

    /// 用环境变量覆盖字段，`lookup` 接收去掉前缀的变量名
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ROUTER_ID") {
            self.router.id = parse_env("ROUTER_ID", &v)?;
        }
        if let Some(v) = lookup("SSHD_PORT") {
            self.sshd.port = parse_env("SSHD_PORT", &v)?;
        }
        if let Some(v) = lookup("TARGET") {
            self.tunnel.target = v;
        }
        if let Some(v) = lookup("TARGET_USERNAME") {
            self.tunnel.username = v;
        }
        if let Some(v) = lookup("PRIV_KEY_PATH") {
            self.identity.private_key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRIV_CERT_PATH") {
            self.identity.certificate_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("PUB_KEY_PATH") {
            self.identity.trust_anchor_path = PathBuf::from(v);
        }
        self.expand_paths();
        Ok(())
    }

    /// 展开路径中的 `~`
    fn expand_paths(&mut self) {
        let identity = &mut self.identity;
        identity.private_key_path = expand_tilde(&identity.private_key_path);
        identity.trust_anchor_path = expand_tilde(&identity.trust_anchor_path);
        if let Some(ref cert) = identity.certificate_path {
            identity.certificate_path = Some(expand_tilde(cert));
        }
    }

    pub fn sshd_server_config(&self) -> SshServerConfig {
        SshServerConfig {
            bind_addr: self.sshd.bind_addr.clone(),
            port: self.sshd.port,
            router_id: self.router.id,
            inactivity_timeout: (self.sshd.inactivity_timeout_secs > 0)
                .then(|| Duration::from_secs(self.sshd.inactivity_timeout_secs)),
        }
    }
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    debug!("Overriding {} from environment", name);
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}{} value '{}': {}", ENV_PREFIX, name, value, e))
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}
