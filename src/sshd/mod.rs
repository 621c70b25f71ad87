//! 本地 SSH 诊断端点
//!
//! 监听入站连接，用信任锚认证对端，每个 shell 通道运行一个诊断 shell。

pub mod auth;
mod handler;
pub mod session;
pub mod shell;
pub mod terminal;

pub use auth::{Authenticator, Credential};
pub use handler::{SessionHandler, EXEC_REJECTED};
pub use session::{PtyInfo, SessionContext, WindowSize};

use crate::error::{Result, TunnelError};
use russh::keys::{PrivateKey, PublicKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// SSH 服务端运行参数
#[derive(Debug, Clone)]
pub struct SshServerConfig {
    pub bind_addr: String,
    /// 0 表示由系统分配
    pub port: u16,
    pub router_id: u32,
    pub inactivity_timeout: Option<Duration>,
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 2222,
            router_id: 1,
            inactivity_timeout: Some(Duration::from_secs(3600)),
        }
    }
}

pub struct SshServer {
    listener: TcpListener,
    port: u16,
    router_id: u32,
    russh_config: Arc<russh::server::Config>,
    authenticator: Arc<Authenticator>,
}

impl SshServer {
    /// 绑定监听地址；只有绑定失败会返回错误
    pub async fn start(
        config: &SshServerConfig,
        host_key: &PrivateKey,
        trust_anchor: PublicKey,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_addr, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::bind_failed(addr.clone(), e))?;
        let port = listener
            .local_addr()
            .map_err(|e| TunnelError::bind_failed(addr.clone(), e))?
            .port();

        let russh_config = russh::server::Config {
            inactivity_timeout: config.inactivity_timeout,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key.clone()],
            ..Default::default()
        };

        info!("SSH server listening on {}:{}", config.bind_addr, port);
        Ok(Self {
            listener,
            port,
            router_id: config.router_id,
            russh_config: Arc::new(russh_config),
            authenticator: Arc::new(Authenticator::new(trust_anchor)),
        })
    }

    /// 实际监听端口
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 接受连接直到 `shutdown` 触发，然后关闭监听；进行中的会话不会被强制断开
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, closing SSH listener on port {}", self.port);
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted SSH connection from {}", peer);
                            let handler = SessionHandler::new(
                                self.authenticator.clone(),
                                self.router_id,
                                Some(peer),
                            );
                            let config = self.russh_config.clone();
                            tokio::spawn(async move {
                                let session = match russh::server::run_stream(config, stream, handler).await {
                                    Ok(session) => session,
                                    Err(e) => {
                                        warn!("SSH handshake with {} failed: {}", peer, e);
                                        return;
                                    }
                                };
                                match session.await {
                                    Ok(()) => trace!("SSH connection from {} closed", peer),
                                    Err(e) if crate::io_util::is_expected_ssh_teardown(&e) => {
                                        trace!("SSH connection from {} ended: {}", peer, e)
                                    }
                                    Err(e) => warn!("SSH connection from {} failed: {}", peer, e),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept SSH connection: {}", e);
                        }
                    }
                }
            }
        }

        drop(self.listener);
        Ok(())
    }
}
