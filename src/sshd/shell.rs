/// 诊断 shell
///
/// 逐行读取命令并应答，直到 `quit`、输入结束或 I/O 错误。
/// 命令处理错误只作为一行文本返回给对端，不会结束会话。
use super::session::SessionContext;
use super::terminal::{Input, Terminal};
use crate::error::{Result, TunnelError};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

pub const HELP_TEXT: &str = "commands available: help, chonk <n>, echo <string>\n";
pub const FALLBACK_TEXT: &str = "no idea what you want\n";
pub const ERROR_PREFIX: &str = "Error handling terminal input: ";

/// `chonk` 允许的最大字节数
pub const MAX_CHONK: usize = 1 << 20;

/// 单条命令的处理结果
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// 空行，不应答
    Silent,
    Quit,
}

/// 解析并执行一行命令
pub fn dispatch(line: &str) -> Result<Reply> {
    if line.trim().is_empty() {
        return Ok(Reply::Silent);
    }

    let line = line.trim_start();
    let (command, rest) = line
        .split_once(|c: char| c.is_whitespace())
        .unwrap_or((line, ""));

    match command {
        "help" => Ok(Reply::Text(HELP_TEXT.to_string())),
        "echo" => Ok(Reply::Text(format!("{}\n", rest))),
        "chonk" => chonk(rest).map(Reply::Text),
        "quit" => Ok(Reply::Quit),
        _ => Ok(Reply::Text(FALLBACK_TEXT.to_string())),
    }
}

fn chonk(arg: &str) -> Result<String> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Err(TunnelError::command("chonk requires a size argument"));
    }
    let size: usize = arg
        .parse()
        .map_err(|e| TunnelError::command(format!("invalid size '{}': {}", arg, e)))?;
    if size > MAX_CHONK {
        return Err(TunnelError::command(format!(
            "size {} exceeds the limit of {}",
            size, MAX_CHONK
        )));
    }

    let mut out = "a".repeat(size);
    out.push('\n');
    Ok(out)
}

/// 在一个会话上运行 shell
pub async fn run<R, W>(mut ctx: SessionContext, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let resize = ctx.resize.take();
    let mut term = Terminal::new(reader, writer, ctx.has_pty(), resize);
    let prompt = ctx.prompt();

    term.write_str(&format!(
        "Welcome to the router diagnostic shell, {}\n",
        ctx.user
    ))
    .await?;

    loop {
        term.write_str(&prompt).await?;

        let line = match term.read_line().await? {
            Input::Line(line) => line,
            Input::Interrupt => continue,
            Input::Eof => break,
        };
        trace!("[{}] command '{}' (width {})", ctx.user, line, term.width());

        match dispatch(&line) {
            Ok(Reply::Text(text)) => term.write_str(&text).await?,
            Ok(Reply::Silent) => {}
            Ok(Reply::Quit) => break,
            Err(e) => {
                term.write_str(&format!("{}{}\n", ERROR_PREFIX, e)).await?;
            }
        }
    }

    debug!("Shell for {} finished", ctx.user);
    term.shutdown().await
}
