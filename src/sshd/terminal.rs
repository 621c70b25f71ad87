/// 最小行编辑器
///
/// 伪终端模式下负责回显、退格、Ctrl-C / Ctrl-D 以及 CRLF 换行；
/// 非伪终端模式下按 `\n` 切行，不回显。
use super::session::WindowSize;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// 单行最大字节数，超出部分丢弃
pub const MAX_LINE_LEN: usize = 4096;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

/// 一次读取的结果
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Line(String),
    /// Ctrl-C，丢弃当前行
    Interrupt,
    /// 输入结束（连接 EOF 或空行上的 Ctrl-D）
    Eof,
}

pub struct Terminal<R, W> {
    reader: R,
    writer: W,
    pty: bool,
    width: Arc<AtomicU32>,
    resize_task: Option<JoinHandle<()>>,
    pending: VecDeque<u8>,
    line: Vec<u8>,
    skip_lf: bool,
    eof: bool,
}

impl<R, W> Terminal<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// 创建终端；若提供了窗口订阅，会启动独立任务跟踪宽度变化
    pub fn new(
        reader: R,
        writer: W,
        pty: bool,
        resize: Option<watch::Receiver<WindowSize>>,
    ) -> Self {
        let width = Arc::new(AtomicU32::new(WindowSize::default().cols));
        let resize_task = resize.map(|rx| {
            width.store(rx.borrow().cols, Ordering::Relaxed);
            tokio::spawn(track_window(rx, width.clone()))
        });

        Self {
            reader,
            writer,
            pty,
            width,
            resize_task,
            pending: VecDeque::new(),
            line: Vec::new(),
            skip_lf: false,
            eof: false,
        }
    }

    /// 当前输出宽度（列）
    pub fn width(&self) -> u32 {
        self.width.load(Ordering::Relaxed)
    }

    /// 写出文本，伪终端模式下 `\n` 转为 `\r\n`
    pub async fn write_str(&mut self, text: &str) -> io::Result<()> {
        if self.pty {
            let converted = text.replace('\n', "\r\n");
            self.writer.write_all(converted.as_bytes()).await?;
        } else {
            self.writer.write_all(text.as_bytes()).await?;
        }
        self.writer.flush().await
    }

    /// 读取一行（不含行尾）
    pub async fn read_line(&mut self) -> io::Result<Input> {
        loop {
            while let Some(byte) = self.pending.pop_front() {
                if let Some(input) = self.feed(byte).await? {
                    return Ok(input);
                }
            }

            if self.eof {
                return Ok(Input::Eof);
            }

            let mut buf = [0u8; 1024];
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                self.eof = true;
                if !self.line.is_empty() {
                    return Ok(Input::Line(self.take_line()));
                }
                return Ok(Input::Eof);
            }
            self.pending.extend(&buf[..n]);
        }
    }

    /// 关闭写端
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    async fn feed(&mut self, byte: u8) -> io::Result<Option<Input>> {
        let skip_lf = std::mem::take(&mut self.skip_lf);

        if !self.pty {
            return Ok(match byte {
                b'\n' => {
                    if self.line.last() == Some(&b'\r') {
                        self.line.pop();
                    }
                    Some(Input::Line(self.take_line()))
                }
                _ => {
                    self.push(byte);
                    None
                }
            });
        }

        match byte {
            b'\n' if skip_lf => Ok(None),
            b'\r' | b'\n' => {
                self.skip_lf = byte == b'\r';
                self.echo(b"\r\n").await?;
                Ok(Some(Input::Line(self.take_line())))
            }
            BACKSPACE | DELETE => {
                if self.pop_char() {
                    self.echo(b"\x08 \x08").await?;
                }
                Ok(None)
            }
            CTRL_C => {
                self.line.clear();
                self.echo(b"^C\r\n").await?;
                Ok(Some(Input::Interrupt))
            }
            CTRL_D if self.line.is_empty() => Ok(Some(Input::Eof)),
            b if b < 0x20 => Ok(None),
            b => {
                if self.push(b) {
                    self.echo(&[b]).await?;
                }
                Ok(None)
            }
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.line.len() >= MAX_LINE_LEN {
            return false;
        }
        self.line.push(byte);
        true
    }

    /// 删除最后一个 UTF-8 字符
    fn pop_char(&mut self) -> bool {
        let mut removed = false;
        while let Some(b) = self.line.pop() {
            removed = true;
            if b & 0xc0 != 0x80 {
                break;
            }
        }
        removed
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.line);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    async fn echo(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }
}

impl<R, W> Drop for Terminal<R, W> {
    fn drop(&mut self) {
        if let Some(task) = self.resize_task.take() {
            task.abort();
        }
    }
}

async fn track_window(mut rx: watch::Receiver<WindowSize>, width: Arc<AtomicU32>) {
    while rx.changed().await.is_ok() {
        let size = *rx.borrow_and_update();
        width.store(size.cols, Ordering::Relaxed);
        debug!("Terminal resized to {}x{}", size.cols, size.rows);
    }
}
