/// 双向连接转发
///
/// 在两条已建立的连接之间双向拷贝数据，受同一个取消信号控制
use crate::io_util::{is_expected_teardown, CancelReader};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// 转发结束策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// 任一方向结束即关闭两端（慢方向尾部数据可能被截断）
    #[default]
    FirstClose,
    /// 一个方向结束后半关闭对端，等待另一方向也结束
    DrainBoth,
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayMode::FirstClose => write!(f, "first_close"),
            RelayMode::DrainBoth => write!(f, "drain_both"),
        }
    }
}

/// 单个方向的结果
#[derive(Debug)]
pub enum Transfer {
    /// 读到 EOF，拷贝了 n 字节
    Finished(u64),
    /// 拷贝出错（包括取消）
    Failed(io::Error),
    /// 另一方向先结束，本方向被放弃
    Abandoned,
}

impl Transfer {
    pub fn is_finished(&self) -> bool {
        matches!(self, Transfer::Finished(_))
    }

    fn from_result(result: io::Result<u64>) -> Self {
        match result {
            Ok(n) => Transfer::Finished(n),
            Err(e) => Transfer::Failed(e),
        }
    }
}

/// 一对连接的转发结果
#[derive(Debug)]
pub struct RelayOutcome {
    pub a_to_b: Transfer,
    pub b_to_a: Transfer,
}

/// 在 `a` 与 `b` 之间双向转发，直到按 `mode` 判定结束或 `shutdown` 触发
///
/// 两端连接在所有退出路径上都会被关闭。
pub async fn run<A, B>(
    shutdown: CancellationToken,
    a: A,
    b: B,
    mode: RelayMode,
    label: &str,
) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, mut a_write) = tokio::io::split(a);
    let (b_read, mut b_write) = tokio::io::split(b);
    let mut a_read = CancelReader::new(a_read, shutdown.clone());
    let mut b_read = CancelReader::new(b_read, shutdown);

    let half_close = mode == RelayMode::DrainBoth;

    let outcome = {
        let a_to_b = pump(&mut a_read, &mut b_write, half_close);
        let b_to_a = pump(&mut b_read, &mut a_write, half_close);

        match mode {
            RelayMode::FirstClose => {
                tokio::pin!(a_to_b, b_to_a);
                tokio::select! {
                    result = &mut a_to_b => RelayOutcome {
                        a_to_b: Transfer::from_result(result),
                        b_to_a: Transfer::Abandoned,
                    },
                    result = &mut b_to_a => RelayOutcome {
                        a_to_b: Transfer::Abandoned,
                        b_to_a: Transfer::from_result(result),
                    },
                }
            }
            RelayMode::DrainBoth => {
                let (ab, ba) = tokio::join!(a_to_b, b_to_a);
                RelayOutcome {
                    a_to_b: Transfer::from_result(ab),
                    b_to_a: Transfer::from_result(ba),
                }
            }
        }
    };

    log_transfer(label, "a->b", &outcome.a_to_b);
    log_transfer(label, "b->a", &outcome.b_to_a);

    // 关闭两端
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    trace!("[{}] relay closed", label);

    outcome
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, half_close: bool) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(reader, writer).await?;
    if half_close {
        writer.shutdown().await?;
    }
    Ok(copied)
}

fn log_transfer(label: &str, direction: &str, transfer: &Transfer) {
    match transfer {
        Transfer::Finished(n) => trace!("[{}] {} finished after {} bytes", label, direction, n),
        Transfer::Failed(e) if is_expected_teardown(e) => {
            trace!("[{}] {} ended: {}", label, direction, e)
        }
        Transfer::Failed(e) => error!("[{}] error while copying {}: {}", label, direction, e),
        Transfer::Abandoned => {}
    }
}
