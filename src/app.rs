/// 进程启动编排
///
/// 加载身份，启动 SSH 服务端，按配置决定是否运行反向隧道，并等待所有服务结束。
use crate::config::AppConfig;
use crate::error::Result;
use crate::identity::{load_identity, load_trust_anchor};
use crate::sshd::SshServer;
use crate::tunnel;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 已启动的服务集合
pub struct App {
    sshd_port: u16,
    tunnel_ports: Vec<u16>,
    services: JoinSet<Result<()>>,
}

impl App {
    /// 启动所有服务；身份加载或端口绑定失败时返回错误
    pub async fn start(config: AppConfig, shutdown: CancellationToken) -> Result<Self> {
        let identity = Arc::new(load_identity(
            &config.identity.private_key_path,
            config.identity.certificate_path.as_deref(),
        )?);
        let anchor = load_trust_anchor(&config.identity.trust_anchor_path)?;

        let server = SshServer::start(&config.sshd_server_config(), &identity.key(), anchor).await?;
        let sshd_port = server.port();

        let mut services = JoinSet::new();
        services.spawn(server.run(shutdown.clone()));

        let mut tunnel_ports = Vec::new();
        if config.tunnel.enabled {
            tunnel_ports = config.tunnel.exposed_ports(sshd_port);
            let tunnel_config = config.tunnel.clone();
            let ports = tunnel_ports.clone();
            let token = shutdown.clone();
            info!(
                "Starting tunnel to {} exposing ports {:?}",
                tunnel_config.target, ports
            );
            services.spawn(async move {
                tunnel::run_with_policy(
                    token,
                    identity,
                    &tunnel_config.username,
                    &tunnel_config.target,
                    &ports,
                    &tunnel_config.options(),
                    &tunnel_config.reconnect.policy(),
                )
                .await;
                Ok(())
            });
        } else {
            info!("Tunnel disabled");
        }

        info!(
            "Router {} services up (sshd port {})",
            config.router.id, sshd_port
        );
        Ok(Self {
            sshd_port,
            tunnel_ports,
            services,
        })
    }

    pub fn sshd_port(&self) -> u16 {
        self.sshd_port
    }

    /// 隧道暴露的本地端口（未启用隧道时为空）
    pub fn tunnel_ports(&self) -> &[u16] {
        &self.tunnel_ports
    }

    /// 等待所有服务结束
    pub async fn wait(mut self) {
        while let Some(joined) = self.services.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Service stopped with error: {}", e),
                Err(e) => error!("Service task failed: {}", e),
            }
        }
        info!("All services stopped");
    }
}

/// 启动并运行到 `shutdown` 触发且所有服务结束
pub async fn run(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let app = App::start(config, shutdown).await?;
    app.wait().await;
    Ok(())
}
