/// russh 客户端回调与转发通道路由
use parking_lot::Mutex;
use russh::client::{Handler, Msg, Session};
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// 每个远程端口待接收通道的队列长度，也是注册完成前可暂存的通道总数
const ROUTE_QUEUE: usize = 64;

#[derive(Default)]
struct RouteTable {
    senders: HashMap<u32, mpsc::Sender<Channel<Msg>>>,
    /// tcpip-forward 应答与端口注册之间到达的通道
    unclaimed: HashMap<u32, Vec<Channel<Msg>>>,
    sealed: bool,
}

impl RouteTable {
    fn unclaimed_len(&self) -> usize {
        self.unclaimed.values().map(Vec::len).sum()
    }
}

/// 按远程端口把 forwarded-tcpip 通道分发给对应的转发器
#[derive(Clone, Default)]
pub struct ForwardRoutes {
    inner: Arc<Mutex<RouteTable>>,
}

impl ForwardRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册远程端口，返回该端口的通道接收端；注册前已到达的通道会先进入队列
    pub fn register(&self, port: u32) -> mpsc::Receiver<Channel<Msg>> {
        let (tx, rx) = mpsc::channel(ROUTE_QUEUE);
        let mut table = self.inner.lock();
        for channel in table.unclaimed.remove(&port).unwrap_or_default() {
            let _ = tx.try_send(channel);
        }
        table.senders.insert(port, tx);
        rx
    }

    /// 所有端口注册完毕；此后找不到端口的通道直接拒绝。返回未被认领的通道
    pub fn seal(&self) -> Vec<Channel<Msg>> {
        let mut table = self.inner.lock();
        table.sealed = true;
        table.unclaimed.drain().flat_map(|(_, v)| v).collect()
    }

    pub fn unregister(&self, port: u32) {
        self.inner.lock().senders.remove(&port);
    }

    /// 当前注册的端口数
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().senders.len()
    }

    /// 分发通道；无法分发时原样退回
    pub fn route(&self, port: u32, channel: Channel<Msg>) -> Result<(), Channel<Msg>> {
        let mut table = self.inner.lock();
        if let Some(tx) = table.senders.get(&port) {
            return tx.try_send(channel).map_err(|e| match e {
                mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
            });
        }
        if table.sealed || table.unclaimed_len() >= ROUTE_QUEUE {
            return Err(channel);
        }
        table.unclaimed.entry(port).or_default().push(channel);
        Ok(())
    }
}

/// 隧道客户端回调
pub struct ClientHandler {
    routes: ForwardRoutes,
}

impl ClientHandler {
    pub fn new(routes: ForwardRoutes) -> Self {
        Self { routes }
    }
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        // 汇合主机的身份不做校验，信任建立在入站侧的证书体系上
        warn!(
            "Accepting rendezvous host key {} without verification",
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        trace!(
            "Forwarded connection {}:{} -> {}:{}",
            originator_address,
            originator_port,
            connected_address,
            connected_port
        );
        if let Err(channel) = self.routes.route(connected_port, channel) {
            warn!(
                "No forwarder accepting connections for remote port {}, closing channel",
                connected_port
            );
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
        }
        Ok(())
    }
}
