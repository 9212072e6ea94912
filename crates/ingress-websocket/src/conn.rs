//! Byte-stream view of a WebSocket connection
//!
//! Traffic from the tunnel arrives as WebSocket frames even when the origin
//! speaks raw TCP. `WebSocketConn` takes the tunnel-side byte stream, acts as
//! the server end of the WebSocket and exposes the message payloads as a
//! plain `AsyncRead + AsyncWrite` stream:
//!
//! - binary and text payloads are read back-to-back, in order
//! - ping/pong frames are consumed (tungstenite answers pings)
//! - a close frame, EOF or cancellation ends the read side
//! - every write is sent as one binary message

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::trace;

/// WebSocket-framed duplex stream over an arbitrary transport
pub struct WebSocketConn<S> {
    inner: WebSocketStream<S>,
    /// Unread remainder of the last message
    pending: Bytes,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    read_closed: bool,
}

impl<S> WebSocketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `io` as the server side of an already-upgraded WebSocket.
    ///
    /// Reads stop once `cancel` is cancelled.
    pub async fn new(cancel: CancellationToken, io: S) -> Self {
        let inner = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
        Self::from_stream(cancel, inner)
    }

    /// Wrap an existing WebSocket stream (any role)
    pub fn from_stream(cancel: CancellationToken, inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            cancelled: Box::pin(cancel.cancelled_owned()),
            read_closed: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.inner.get_mut()
    }
}

fn into_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WebSocketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            if this.cancelled.as_mut().poll(cx).is_ready() {
                trace!("WebSocket read cancelled");
                this.read_closed = true;
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = Bytes::from(data),
                Some(Ok(Message::Text(text))) => this.pending = Bytes::from(text),
                Some(Ok(Message::Close(frame))) => {
                    trace!("WebSocket close frame received: {:?}", frame);
                    this.read_closed = true;
                }
                Some(Ok(_)) => {
                    // Ping, pong and raw frames carry no stream data
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    this.read_closed = true;
                }
                Some(Err(e)) => {
                    this.read_closed = true;
                    return Poll::Ready(Err(into_io_error(e)));
                }
            }
        }
    }
}

impl<S> AsyncWrite for WebSocketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = Pin::new(&mut self.inner);

        ready!(inner.as_mut().poll_ready(cx)).map_err(into_io_error)?;
        inner
            .as_mut()
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(into_io_error)?;

        // Push the frame towards the transport; a pending flush is finished
        // by the next poll_ready or poll_flush.
        if let Poll::Ready(Err(e)) = inner.poll_flush(cx) {
            return Poll::Ready(Err(into_io_error(e)));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(into_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(into_io_error(e))),
        }
    }
}
