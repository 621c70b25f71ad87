/// russh 服务端回调
///
/// 把库的回调转换成 `SessionContext` 与字节流，然后交给诊断 shell。
use super::auth::{Authenticator, Credential};
use super::session::{PtyInfo, SessionContext, WindowSize};
use super::shell;
use crate::io_util::is_expected_teardown;
use russh::keys::{Certificate, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

pub const EXEC_REJECTED: &str = "raw commands are not supported\n";

/// 会话中一个 session 通道的状态
#[derive(Default)]
struct ChannelState {
    /// shell 或 exec 启动后被取走
    channel: Option<Channel<Msg>>,
    pty: Option<PtyInfo>,
    resize: Option<watch::Sender<WindowSize>>,
}

/// 每个入站连接一个实例
pub struct SessionHandler {
    authenticator: Arc<Authenticator>,
    router_id: u32,
    peer: Option<SocketAddr>,
    user: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SessionHandler {
    pub fn new(authenticator: Arc<Authenticator>, router_id: u32, peer: Option<SocketAddr>) -> Self {
        Self {
            authenticator,
            router_id,
            peer,
            user: None,
            channels: HashMap::new(),
        }
    }

    fn peer_label(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn decide(&mut self, user: &str, credential: Credential<'_>) -> Auth {
        if self.authenticator.authenticate(&credential) {
            info!("Accepted {} from {}", user, self.peer_label());
            self.user = Some(user.to_string());
            Auth::Accept
        } else {
            debug!("Rejected {} from {}", user, self.peer_label());
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }
}

impl Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.decide(user, Credential::Unsupported("none")))
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(self.decide(user, Credential::Unsupported("password")))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.decide(user, Credential::Key(public_key)))
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        Ok(self.decide(user, Credential::Certificate(certificate)))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        trace!("Session channel {:?} opened by {}", channel.id(), self.peer_label());
        self.channels.insert(
            channel.id(),
            ChannelState {
                channel: Some(channel),
                ..Default::default()
            },
        );
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel) {
            Some(state) => {
                state.pty = Some(PtyInfo {
                    term: term.to_string(),
                    size: WindowSize {
                        cols: col_width,
                        rows: row_height,
                    },
                });
                session.channel_success(channel)?;
            }
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = WindowSize {
            cols: col_width,
            rows: row_height,
        };
        if let Some(state) = self.channels.get_mut(&channel) {
            if let Some(pty) = state.pty.as_mut() {
                pty.size = size;
            }
            if let Some(tx) = state.resize.as_ref() {
                let _ = tx.send(size);
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let user = self.user.clone().unwrap_or_default();
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        let Some(chan) = state.channel.take() else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        let ctx = match state.pty.clone() {
            Some(pty) => {
                let (ctx, tx) = SessionContext::with_pty(user, self.router_id, pty);
                state.resize = Some(tx);
                ctx
            }
            None => SessionContext::plain(user, self.router_id),
        };
        session.channel_success(channel)?;

        let handle = session.handle();
        let peer = self.peer_label();
        tokio::spawn(async move {
            let user = ctx.user.clone();
            let (reader, writer) = tokio::io::split(chan.into_stream());
            match shell::run(ctx, reader, writer).await {
                Ok(()) => debug!("Shell for {} ({}) closed", user, peer),
                Err(e) if is_expected_teardown(&e) => {
                    trace!("Shell for {} ({}) ended: {}", user, peer, e)
                }
                Err(e) => error!("Shell for {} ({}) failed: {}", user, peer, e),
            }
            let _ = handle.exit_status_request(channel, 0).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            "Rejected exec request '{}' from {}",
            String::from_utf8_lossy(data),
            self.peer_label()
        );
        let Some(chan) = self
            .channels
            .get_mut(&channel)
            .and_then(|state| state.channel.take())
        else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        session.channel_success(channel)?;

        tokio::spawn(async move {
            let _ = chan.data(EXEC_REJECTED.as_bytes()).await;
            let _ = chan.exit_status(1).await;
            let _ = chan.eof().await;
            let _ = chan.close().await;
        });
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // 丢弃 resize 发送端，窗口跟踪任务随之结束
        self.channels.remove(&channel);
        trace!("Session channel {:?} closed", channel);
        Ok(())
    }
}
