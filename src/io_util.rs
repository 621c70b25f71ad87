/// 可取消 I/O 辅助模块
///
/// 提供感知取消信号的读取包装器，以及区分"预期的关闭错误"与真实故障的分类函数
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// 取消后读取返回的错误信息
pub const CANCELLED_MESSAGE: &str = "read cancelled by shutdown signal";

/// 感知取消信号的读取器
///
/// 取消信号触发后，挂起中的读取立即以 `ConnectionAborted` 错误返回，
/// 而不是无限期阻塞在底层连接上。
///
/// # 示例
/// ```rust
/// use router_tunnel::io_util::CancelReader;
/// use tokio::io::AsyncReadExt;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let token = CancellationToken::new();
/// let (_client, server) = tokio::io::duplex(64);
/// let mut reader = CancelReader::new(server, token.clone());
/// token.cancel();
/// let mut buf = [0u8; 8];
/// assert!(reader.read(&mut buf).await.is_err());
/// # }
/// ```
pub struct CancelReader<R> {
    inner: R,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<R> CancelReader<R> {
    pub fn new(inner: R, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            cancelled,
        }
    }
}

impl<R> AsyncRead for CancelReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.token.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(cancelled_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// 构造取消错误
pub fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, CANCELLED_MESSAGE)
}

/// 判断 I/O 错误是否属于取消/关闭导致的预期错误
///
/// 预期错误只记录 trace 级别日志，不作为故障处理
pub fn is_expected_teardown(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => true,
        _ => is_closed_message(&err.to_string()),
    }
}

/// 判断 SSH 层错误是否属于连接关闭导致的预期错误
pub fn is_expected_ssh_teardown(err: &russh::Error) -> bool {
    match err {
        russh::Error::Disconnect | russh::Error::SendError => true,
        russh::Error::IO(e) => is_expected_teardown(e),
        other => is_closed_message(&other.to_string()),
    }
}

fn is_closed_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg == "eof" || msg.contains("closed") || msg.contains("cancelled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_cancel_reader_passes_data_through() {
        let token = CancellationToken::new();
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = CancelReader::new(server, token);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_cancel_reader_unblocks_pending_read() {
        let token = CancellationToken::new();
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = CancelReader::new(server, token.clone());

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("read should unblock after cancel")
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(is_expected_teardown(&err));
    }

    #[tokio::test]
    async fn test_cancel_reader_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"ignored").await.unwrap();

        let mut reader = CancelReader::new(server, token);
        let mut buf = [0u8; 8];
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[test]
    fn test_expected_teardown_classification() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let closed = io::Error::other("use of closed network connection");
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");

        assert!(is_expected_teardown(&eof));
        assert!(is_expected_teardown(&reset));
        assert!(is_expected_teardown(&closed));
        assert!(!is_expected_teardown(&refused));
        assert!(!is_expected_teardown(&denied));
    }

    #[test]
    fn test_expected_ssh_teardown_classification() {
        assert!(is_expected_ssh_teardown(&russh::Error::Disconnect));
        assert!(is_expected_ssh_teardown(&russh::Error::IO(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe"
        ))));
    }
}
