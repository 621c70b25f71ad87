/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，库内部统一返回 `TunnelError`，
/// 二进制入口再用 anyhow 汇总
use std::io;
use thiserror::Error;

/// Router Tunnel 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 监听端口绑定失败
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 连接失败
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// 认证失败
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 密钥/证书加载错误
    #[error("Identity error: {0}")]
    IdentityError(String),

    /// 远程监听（tcpip-forward）失败
    #[error("Remote listen on port {port} failed: {reason}")]
    RemoteListenFailed { port: u16, reason: String },

    /// 命令处理错误（只返回给诊断 shell 的对端）
    #[error("{0}")]
    CommandError(String),

    /// SSH 协议库错误
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建绑定失败错误
    pub fn bind_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::BindFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// 创建认证失败错误
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// 创建密钥加载错误
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::IdentityError(msg.into())
    }

    /// 创建远程监听失败错误
    pub fn remote_listen_failed(port: u16, reason: impl ToString) -> Self {
        Self::RemoteListenFailed {
            port,
            reason: reason.to_string(),
        }
    }

    /// 创建命令错误
    pub fn command(msg: impl Into<String>) -> Self {
        Self::CommandError(msg.into())
    }

    /// 检查是否为认证失败
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    /// 检查是否为启动期致命错误（进程应退出）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BindFailed { .. } | Self::IdentityError(_)
        )
    }
}
