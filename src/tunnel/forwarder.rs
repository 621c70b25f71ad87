/// 反向转发器
///
/// 每个本地端口一个：从远程监听接受连接，拨号本地端口，成功后为这一对连接启动转发。
/// 本地服务暂时不可用时关闭远程连接、稍作等待后继续接受。
use super::handler::{ClientHandler, ForwardRoutes};
use crate::io_util::is_expected_teardown;
use crate::relay::{self, RelayMode};
use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// 远程监听抽象
#[async_trait]
pub trait RemoteListener: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// 远程分配的端口
    fn remote_port(&self) -> u32;

    /// 等待下一个远程连接；`None` 表示监听已关闭
    async fn accept(&mut self) -> Option<Self::Conn>;

    /// 关闭监听，只会被调用一次
    async fn close(&mut self);
}

/// 通过 SSH `tcpip-forward` 建立的远程监听
pub struct SshRemoteListener {
    handle: Arc<Handle<ClientHandler>>,
    routes: ForwardRoutes,
    bind_address: String,
    port: u32,
    incoming: mpsc::Receiver<Channel<Msg>>,
}

impl SshRemoteListener {
    pub fn new(
        handle: Arc<Handle<ClientHandler>>,
        routes: ForwardRoutes,
        bind_address: impl Into<String>,
        port: u32,
        incoming: mpsc::Receiver<Channel<Msg>>,
    ) -> Self {
        Self {
            handle,
            routes,
            bind_address: bind_address.into(),
            port,
            incoming,
        }
    }
}

#[async_trait]
impl RemoteListener for SshRemoteListener {
    type Conn = ChannelStream<Msg>;

    fn remote_port(&self) -> u32 {
        self.port
    }

    async fn accept(&mut self) -> Option<Self::Conn> {
        self.incoming.recv().await.map(Channel::into_stream)
    }

    async fn close(&mut self) {
        self.routes.unregister(self.port);
        self.incoming.close();
        // 排空已排队的通道
        while let Ok(channel) = self.incoming.try_recv() {
            let _ = channel.close().await;
        }
        if let Err(e) = self
            .handle
            .cancel_tcpip_forward(self.bind_address.clone(), self.port)
            .await
        {
            trace!("cancel-tcpip-forward for port {} failed: {}", self.port, e);
        }
    }
}

/// 转发器参数
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub local_host: String,
    pub retry_delay: Duration,
    pub relay_mode: RelayMode,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            local_host: "localhost".to_string(),
            retry_delay: Duration::from_secs(1),
            relay_mode: RelayMode::default(),
        }
    }
}

/// 单个转发器运行结束时的计数
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderReport {
    pub accepted: u64,
    pub relayed: u64,
    pub dial_failures: u64,
}

pub struct ReverseForwarder<L> {
    listener: L,
    local_port: u16,
    options: ForwarderOptions,
}

impl<L: RemoteListener> ReverseForwarder<L> {
    pub fn new(listener: L, local_port: u16, options: ForwarderOptions) -> Self {
        Self {
            listener,
            local_port,
            options,
        }
    }

    /// 运行接受循环，直到 `shutdown` 触发或远程监听关闭
    ///
    /// 返回前会关闭监听，并等待本转发器启动的所有转发任务结束。
    pub async fn run(mut self, shutdown: CancellationToken) -> ForwarderReport {
        let target = format!("{}:{}", self.options.local_host, self.local_port);
        let remote_port = self.listener.remote_port();
        let relay_token = shutdown.child_token();
        let mut relays = JoinSet::new();
        let mut report = ForwarderReport::default();

        info!("Forwarding remote port {} to {}", remote_port, target);

        loop {
            let mut remote = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = joined {
                        error!("[{}] relay task failed: {}", target, e);
                    }
                    continue;
                }
                accepted = self.listener.accept() => match accepted {
                    Some(conn) => conn,
                    None => {
                        debug!("Remote listener on port {} closed", remote_port);
                        break;
                    }
                },
            };
            report.accepted += 1;

            let dialed = tokio::select! {
                _ = shutdown.cancelled() => break,
                dialed = TcpStream::connect(&target) => dialed,
            };

            match dialed {
                Ok(local) => {
                    report.relayed += 1;
                    trace!("[{}] relaying connection #{}", target, report.accepted);
                    let token = relay_token.clone();
                    let mode = self.options.relay_mode;
                    let label = format!("{}#{}", target, report.accepted);
                    relays.spawn(async move {
                        relay::run(token, remote, local, mode, &label).await;
                    });
                }
                Err(e) => {
                    report.dial_failures += 1;
                    if is_expected_teardown(&e) {
                        trace!("Failed to dial {}: {}", target, e);
                    } else {
                        warn!("Failed to dial {}: {}", target, e);
                    }
                    let _ = remote.shutdown().await;
                    drop(remote);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
            }
        }

        self.listener.close().await;
        relay_token.cancel();
        while relays.join_next().await.is_some() {}

        info!(
            "Forwarder for remote port {} stopped ({} accepted, {} relayed, {} dial failures)",
            remote_port, report.accepted, report.relayed, report.dial_failures
        );
        report
    }
}
