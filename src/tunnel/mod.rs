//! 反向隧道
//!
//! 向汇合主机拨出一条 SSH 连接，打开控制会话，并为每个本地端口请求一个远程分配的监听端口，
//! 把远程接受的连接转发回本地服务。

pub mod control;
pub mod forwarder;
mod handler;
pub mod policy;

pub use forwarder::{ForwarderOptions, ForwarderReport, RemoteListener, ReverseForwarder};
pub use handler::{ClientHandler, ForwardRoutes};
pub use policy::{ReconnectMode, ReconnectPolicy};

use crate::error::{Result, TunnelError};
use crate::identity::Identity;
use forwarder::SshRemoteListener;
use russh::client::{self, Handle, Msg};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, Disconnect};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// 隧道参数
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// 拨号或认证失败后返回前的等待
    pub dial_failure_delay: Duration,
    /// 建立阶段的总时限，None 表示不限
    pub setup_timeout: Option<Duration>,
    /// 在汇合主机上请求监听的地址
    pub remote_bind_address: String,
    pub keepalive_interval: Option<Duration>,
    pub forwarder: ForwarderOptions,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            dial_failure_delay: Duration::from_secs(1),
            setup_timeout: Some(Duration::from_secs(30)),
            remote_bind_address: "localhost".to_string(),
            keepalive_interval: Some(Duration::from_secs(15)),
            forwarder: ForwarderOptions::default(),
        }
    }
}

/// 一个远程端口与本地端口的绑定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    pub local_port: u16,
    pub remote_port: u32,
}

/// 一次 `connect` 的结果
#[derive(Debug, Clone, Default)]
pub struct TunnelSummary {
    pub hostname: Option<String>,
    pub forwards: Vec<PortForward>,
    /// true 表示因外部取消结束，false 表示控制会话自行结束
    pub cancelled: bool,
}

/// 建立一次隧道并运行到取消或控制会话结束
///
/// 只尝试一次，不在内部重试。返回前所有转发器都已结束，出站连接已断开。
/// 建立阶段（拨号、认证、控制会话、远程监听请求）同样响应取消，并受 `setup_timeout` 限制。
pub async fn connect(
    shutdown: CancellationToken,
    identity: Arc<Identity>,
    username: &str,
    target: &str,
    ports: &[u16],
    options: &TunnelOptions,
) -> Result<TunnelSummary> {
    let routes = ForwardRoutes::new();
    let deadline = options.setup_timeout.map(|t| Instant::now() + t);

    let dialing = dial(target, username, &identity, routes.clone(), options);
    let dialed = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Tunnel to {} cancelled while dialing", target);
            return Ok(cancelled_summary());
        }
        dialed = within_deadline(deadline, target, dialing) => dialed,
    };
    let mut handle = match dialed {
        Ok(handle) => handle,
        Err(e) => {
            error!("Tunnel to {} failed: {}", target, e);
            if e.is_auth_failed() {
                warn!("Check that the rendezvous host trusts key {}", identity.fingerprint());
            }
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(options.dial_failure_delay) => {}
            }
            return Err(e);
        }
    };
    info!("Connected to {} as {}", target, username);

    let establishing = establish(&mut handle, &routes, target, ports, options);
    let established = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = within_deadline(deadline, target, establishing) => Some(result),
    };
    let Established {
        control,
        forwards,
        incoming,
    } = match established {
        Some(Ok(established)) => established,
        Some(Err(e)) => {
            error!("Tunnel setup on {} failed: {}", target, e);
            disconnect(&handle).await;
            return Err(e);
        }
        None => {
            info!("Tunnel to {} cancelled during setup", target);
            disconnect(&handle).await;
            return Ok(cancelled_summary());
        }
    };

    for channel in routes.seal() {
        warn!("Closing forwarded channel for a port that was never requested");
        let _ = channel.close().await;
    }

    let handle = Arc::new(handle);
    let forward_token = shutdown.child_token();
    let mut control_task = tokio::spawn(control::watch(control, forward_token.clone()));

    let mut forwarders = JoinSet::new();
    for (forward, rx) in forwards.iter().zip(incoming) {
        let listener = SshRemoteListener::new(
            handle.clone(),
            routes.clone(),
            options.remote_bind_address.clone(),
            forward.remote_port,
            rx,
        );
        let forwarder = ReverseForwarder::new(listener, forward.local_port, options.forwarder.clone());
        forwarders.spawn(forwarder.run(forward_token.clone()));
    }

    let (hostname, cancelled) = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Tunnel to {} cancelled", target);
            forward_token.cancel();
            (control_task.await.ok().flatten(), true)
        }
        joined = &mut control_task => {
            warn!("Control session to {} ended, tearing down forwarders", target);
            forward_token.cancel();
            (joined.ok().flatten(), false)
        }
    };

    while let Some(joined) = forwarders.join_next().await {
        match joined {
            Ok(report) => debug!("Forwarder finished: {:?}", report),
            Err(e) => error!("Forwarder task failed: {}", e),
        }
    }

    disconnect(&handle).await;
    debug!("{} forward routes left after teardown", routes.len());
    info!("Tunnel to {} closed", target);

    Ok(TunnelSummary {
        hostname,
        forwards,
        cancelled,
    })
}

/// 按重连策略反复调用 [`connect`]，直到取消或策略放弃
pub async fn run_with_policy(
    shutdown: CancellationToken,
    identity: Arc<Identity>,
    username: &str,
    target: &str,
    ports: &[u16],
    options: &TunnelOptions,
    policy: &ReconnectPolicy,
) {
    let mut attempt: u32 = 0;

    loop {
        let result = connect(
            shutdown.clone(),
            identity.clone(),
            username,
            target,
            ports,
            options,
        )
        .await;

        if shutdown.is_cancelled() {
            break;
        }

        // 成功建立过连接则重新计数
        attempt = match result {
            Ok(_) => 1,
            Err(_) => attempt.saturating_add(1),
        };

        let Some(delay) = policy.delay_after(attempt) else {
            info!("Tunnel to {} stopped, not reconnecting", target);
            break;
        };

        info!(
            "Reconnecting to {} in {:?} (attempt {})",
            target,
            delay,
            attempt + 1
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn cancelled_summary() -> TunnelSummary {
    TunnelSummary {
        cancelled: true,
        ..Default::default()
    }
}

async fn within_deadline<T>(
    deadline: Option<Instant>,
    target: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| TunnelError::connection_failed(target, "tunnel setup timed out"))?,
        None => fut.await,
    }
}

/// 已建立但尚未开始转发的隧道
struct Established {
    control: Channel<Msg>,
    forwards: Vec<PortForward>,
    incoming: Vec<mpsc::Receiver<Channel<Msg>>>,
}

/// 打开控制会话并依次请求所有远程监听；失败时撤销已完成的部分
async fn establish(
    handle: &mut Handle<ClientHandler>,
    routes: &ForwardRoutes,
    target: &str,
    ports: &[u16],
    options: &TunnelOptions,
) -> Result<Established> {
    let control = control::open(handle).await?;

    // tcpip-forward 需要独占 handle，先依次请求所有远程监听
    let mut forwards = Vec::with_capacity(ports.len());
    let mut incoming = Vec::with_capacity(ports.len());
    for &local_port in ports {
        match request_forward(handle, &options.remote_bind_address, local_port).await {
            Ok(remote_port) => {
                info!(
                    "Remote port {} on {} forwards to local port {}",
                    remote_port, target, local_port
                );
                incoming.push(routes.register(remote_port));
                forwards.push(PortForward {
                    local_port,
                    remote_port,
                });
            }
            Err(e) => {
                for forward in &forwards {
                    routes.unregister(forward.remote_port);
                    let _ = handle
                        .cancel_tcpip_forward(options.remote_bind_address.clone(), forward.remote_port)
                        .await;
                }
                let _ = control.close().await;
                return Err(e);
            }
        }
    }

    Ok(Established {
        control,
        forwards,
        incoming,
    })
}

async fn dial(
    target: &str,
    username: &str,
    identity: &Identity,
    routes: ForwardRoutes,
    options: &TunnelOptions,
) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client::Config {
        keepalive_interval: options.keepalive_interval,
        ..Default::default()
    });

    let mut handle = client::connect(config, target, ClientHandler::new(routes))
        .await
        .map_err(|e| TunnelError::connection_failed(target, e))?;

    if let Some(cert) = identity.certificate() {
        let result = handle
            .authenticate_openssh_cert(username, identity.key(), cert.clone())
            .await?;
        if result.success() {
            debug!("Authenticated to {} with certificate", target);
            return Ok(handle);
        }
        debug!("Certificate rejected by {}, trying raw key", target);
    }

    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    let result = handle
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(identity.key(), hash_alg))
        .await?;
    if !result.success() {
        return Err(TunnelError::auth_failed(format!(
            "{} rejected key {} for user {}",
            target,
            identity.fingerprint(),
            username
        )));
    }
    Ok(handle)
}

async fn request_forward(
    handle: &mut Handle<ClientHandler>,
    bind_address: &str,
    local_port: u16,
) -> Result<u32> {
    let remote_port = handle
        .tcpip_forward(bind_address, 0)
        .await
        .map_err(|e| TunnelError::remote_listen_failed(local_port, e))?;
    if remote_port == 0 {
        return Err(TunnelError::remote_listen_failed(
            local_port,
            "rendezvous host did not allocate a port",
        ));
    }
    Ok(remote_port)
}

async fn disconnect(handle: &Handle<ClientHandler>) {
    let sent = tokio::time::timeout(
        DISCONNECT_TIMEOUT,
        handle.disconnect(Disconnect::ByApplication, "tunnel closed", "en"),
    )
    .await;
    match sent {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Disconnect failed: {}", e),
        Err(_) => debug!("Disconnect timed out"),
    }
}
