/// 入站会话上下文
///
/// SSH 库回调在 handler 中一次性转换成这里的类型，shell 与终端只依赖它们。
use tokio::sync::watch;

/// 终端窗口尺寸（字符单位）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// 协商得到的伪终端
#[derive(Debug, Clone)]
pub struct PtyInfo {
    pub term: String,
    pub size: WindowSize,
}

/// 一个已认证 shell 会话的上下文
#[derive(Debug)]
pub struct SessionContext {
    pub user: String,
    pub router_id: u32,
    pub pty: Option<PtyInfo>,
    /// 窗口尺寸变化订阅，仅在协商了伪终端时存在
    pub resize: Option<watch::Receiver<WindowSize>>,
}

impl SessionContext {
    /// 无伪终端的会话
    pub fn plain(user: impl Into<String>, router_id: u32) -> Self {
        Self {
            user: user.into(),
            router_id,
            pty: None,
            resize: None,
        }
    }

    /// 带伪终端的会话，返回用于推送窗口变化的发送端
    pub fn with_pty(
        user: impl Into<String>,
        router_id: u32,
        pty: PtyInfo,
    ) -> (Self, watch::Sender<WindowSize>) {
        let (tx, rx) = watch::channel(pty.size);
        let ctx = Self {
            user: user.into(),
            router_id,
            pty: Some(pty),
            resize: Some(rx),
        };
        (ctx, tx)
    }

    pub fn has_pty(&self) -> bool {
        self.pty.is_some()
    }

    pub fn prompt(&self) -> String {
        format!("{} (id: {})> ", self.user, self.router_id)
    }
}
