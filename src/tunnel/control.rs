/// 控制会话
///
/// 在汇合主机上打开一个交互 shell，并持续扫描其输出中的 `HOSTNAME=<value>` 行。
use super::handler::ClientHandler;
use crate::error::Result;
use crate::sshd::terminal::MAX_LINE_LEN;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Pty};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

const HOSTNAME_MARKER: &str = "HOSTNAME=";
const TERM: &str = "xterm";
const COLS: u32 = 80;
const ROWS: u32 = 40;
const BAUD: u32 = 14400;

/// 打开控制会话：伪终端（关闭回显）+ 交互 shell
pub async fn open(handle: &Handle<ClientHandler>) -> Result<Channel<Msg>> {
    let channel = handle.channel_open_session().await?;
    let modes = [
        (Pty::ECHO, 0),
        (Pty::TTY_OP_ISPEED, BAUD),
        (Pty::TTY_OP_OSPEED, BAUD),
    ];
    channel
        .request_pty(true, TERM, COLS, ROWS, 0, 0, &modes)
        .await?;
    channel.request_shell(true).await?;
    debug!("Control session {:?} opened", channel.id());
    Ok(channel)
}

/// 扫描控制会话输出直到会话结束或 `shutdown` 触发，返回最后一次看到的主机名
pub async fn watch(mut channel: Channel<Msg>, shutdown: CancellationToken) -> Option<String> {
    let mut scanner = HostnameScanner::default();

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => {
                trace!("Closing control session");
                let _ = channel.close().await;
                break;
            }
            msg = channel.wait() => msg,
        };

        match msg {
            Some(ChannelMsg::Data { data }) => scanner.feed(&data),
            Some(ChannelMsg::ExtendedData { data, .. }) => scanner.feed(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                debug!("Control shell exited with status {}", exit_status);
            }
            Some(ChannelMsg::Eof) => trace!("Control session EOF"),
            Some(ChannelMsg::Close) | None => {
                debug!("Control session closed by remote");
                break;
            }
            Some(other) => trace!("Control session message: {:?}", other),
        }
    }

    scanner.finish();
    scanner.hostname
}

/// 按行扫描输出中的主机名标记，只认行首的标记；超长行截断到 [`MAX_LINE_LEN`]
#[derive(Debug, Default)]
pub struct HostnameScanner {
    partial: Vec<u8>,
    hostname: Option<String>,
}

impl HostnameScanner {
    pub fn feed(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.partial);
                self.scan_line(&line);
            } else if self.partial.len() < MAX_LINE_LEN {
                self.partial.push(byte);
            }
        }
    }

    /// 处理没有换行结尾的最后一行
    pub fn finish(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.scan_line(&line);
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn scan_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        trace!("control: {}", line);

        if let Some(value) = line.strip_prefix(HOSTNAME_MARKER) {
            let value = value.trim();
            if !value.is_empty() {
                info!("Rendezvous host reports hostname {}", value);
                self.hostname = Some(value.to_string());
            }
        }
    }
}
