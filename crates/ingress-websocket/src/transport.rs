//! Byte transport to an origin WebSocket once the upgrade has completed

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;

/// Dialed origin socket (plain or TLS) after the WebSocket handshake
pub type OriginWebSocket = HandshakeStream<MaybeTlsStream<TcpStream>>;

/// Transport that records what the handshake reads, so frames the origin
/// sent in the same segment as its upgrade response are not lost.
///
/// After [`HandshakeStream::finish_handshake`], reads return those bytes
/// first and then continue on the underlying stream.
#[derive(Debug)]
pub struct HandshakeStream<S> {
    inner: S,
    recorded: Option<Vec<u8>>,
    early: Bytes,
}

impl<S> HandshakeStream<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            recorded: Some(Vec::new()),
            early: Bytes::new(),
        }
    }

    /// Stop recording and queue whatever followed the response head
    pub(crate) fn finish_handshake(&mut self) {
        let Some(recorded) = self.recorded.take() else {
            return;
        };
        if let Some(end) = head_end(&recorded) {
            self.early = Bytes::from(recorded).slice(end..);
        }
    }

    /// Bytes received behind the upgrade response and not yet read
    pub fn early_data(&self) -> &[u8] {
        &self.early
    }
}

/// Offset just past the first `\r\n\r\n`
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

impl<S: AsyncRead + Unpin> AsyncRead for HandshakeStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.early.is_empty() {
            let n = this.early.len().min(buf.remaining());
            buf.put_slice(&this.early.split_to(n));
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(recorded) = this.recorded.as_mut() {
            recorded.extend_from_slice(&buf.filled()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HandshakeStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const HEAD: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";

    #[tokio::test]
    async fn test_bytes_after_head_are_replayed() {
        let (inner, mut origin) = tokio::io::duplex(1024);
        let mut stream = HandshakeStream::new(inner);

        let mut segment = HEAD.to_vec();
        segment.extend_from_slice(b"early");
        origin.write_all(&segment).await.unwrap();

        // A handshake reader may pull more than the head in one read
        let mut buf = vec![0u8; segment.len()];
        stream.read_exact(&mut buf).await.unwrap();
        stream.finish_handshake();
        assert_eq!(stream.early_data(), b"early");

        origin.write_all(b" later").await.unwrap();
        let mut rest = [0u8; 11];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"early later");
        assert!(stream.early_data().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_after_head() {
        let (inner, mut origin) = tokio::io::duplex(1024);
        let mut stream = HandshakeStream::new(inner);

        origin.write_all(HEAD).await.unwrap();
        let mut buf = vec![0u8; HEAD.len()];
        stream.read_exact(&mut buf).await.unwrap();
        stream.finish_handshake();
        assert!(stream.early_data().is_empty());

        origin.write_all(b"frame").await.unwrap();
        let mut frame = [0u8; 5];
        stream.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"frame");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (inner, mut origin) = tokio::io::duplex(1024);
        let mut stream = HandshakeStream::new(inner);

        stream.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");
    }
}
