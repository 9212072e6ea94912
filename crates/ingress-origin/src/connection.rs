//! Origin connections: one per tunnel stream, bridging it to the service an
//! ingress rule points at.

use async_trait::async_trait;
use ingress_ipaccess::Policy;
use ingress_websocket::{client_connect, OriginWebSocket, Response, WebSocketConn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::http::Request;
use crate::lifecycle::Lifecycle;
use crate::stream::{pipe, TunnelIo};
use crate::OriginError;

/// Bridge between a tunnel stream and an origin service.
///
/// Lifecycle: construct, call `stream` at most once, call `close` once
/// (after `stream` returns, or from another task to cut it short).
#[async_trait]
pub trait OriginConnection: Send + Sync {
    /// Relay between `tunnel` and the origin until one side is done.
    ///
    /// Returns only after the relay for this call has been torn down. The
    /// tunnel stream is borrowed and never closed here.
    async fn stream(&self, cancel: CancellationToken, tunnel: &mut dyn TunnelIo);

    /// Release the origin resource. Never blocks; an in-flight `stream`
    /// returns promptly and its origin socket is closed.
    fn close(&self);
}

/// Relay strategy used by [`TcpOverWsConnection`] once the tunnel has been
/// unwrapped from WebSocket framing
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, tunnel: &mut dyn TunnelIo, origin: &mut TcpStream);
}

/// Plain two-way copy
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStreamHandler;

#[async_trait]
impl StreamHandler for DefaultStreamHandler {
    async fn handle(&self, tunnel: &mut dyn TunnelIo, origin: &mut TcpStream) {
        pipe(tunnel, origin).await;
    }
}

/// Raw TCP origin, bytes copied as-is
pub struct TcpConnection {
    origin: Lifecycle<TcpStream>,
}

impl TcpConnection {
    /// Wrap an already-dialed origin socket
    pub fn new(origin: TcpStream) -> Self {
        Self {
            origin: Lifecycle::new(origin),
        }
    }
}

#[async_trait]
impl OriginConnection for TcpConnection {
    async fn stream(&self, _cancel: CancellationToken, tunnel: &mut dyn TunnelIo) {
        let Some(mut origin) = self.origin.take() else {
            debug!("TCP origin already streamed or closed");
            return;
        };

        tokio::select! {
            direction = pipe(tunnel, &mut origin) => {
                debug!(?direction, "TCP origin stream finished");
            }
            _ = self.origin.closed() => {
                debug!("TCP origin stream interrupted by close");
            }
        }
    }

    fn close(&self) {
        if let Some(origin) = self.origin.close() {
            debug!(peer = ?origin.peer_addr().ok(), "Closing unused TCP origin connection");
        }
    }
}

/// Raw TCP origin behind a tunnel that carries the bytes in WebSocket frames
pub struct TcpOverWsConnection {
    origin: Lifecycle<TcpStream>,
    handler: Arc<dyn StreamHandler>,
}

impl TcpOverWsConnection {
    pub fn new(origin: TcpStream) -> Self {
        Self::with_handler(origin, Arc::new(DefaultStreamHandler))
    }

    /// Use `handler` instead of the plain copy once the tunnel is unframed
    pub fn with_handler(origin: TcpStream, handler: Arc<dyn StreamHandler>) -> Self {
        Self {
            origin: Lifecycle::new(origin),
            handler,
        }
    }
}

#[async_trait]
impl OriginConnection for TcpOverWsConnection {
    async fn stream(&self, cancel: CancellationToken, tunnel: &mut dyn TunnelIo) {
        let Some(mut origin) = self.origin.take() else {
            debug!("TCP-over-WebSocket origin already streamed or closed");
            return;
        };

        let mut framed = WebSocketConn::new(cancel, tunnel).await;

        tokio::select! {
            _ = self.handler.handle(&mut framed, &mut origin) => {
                debug!("TCP-over-WebSocket origin stream finished");
            }
            _ = self.origin.closed() => {
                debug!("TCP-over-WebSocket origin stream interrupted by close");
            }
        }
    }

    fn close(&self) {
        if let Some(origin) = self.origin.close() {
            debug!(peer = ?origin.peer_addr().ok(), "Closing unused TCP origin connection");
        }
    }
}

struct WsOrigin {
    ws: OriginWebSocket,
    /// Body of the upgrade response, released together with the socket
    body: Option<Vec<u8>>,
}

/// WebSocket origin; the tunnel already carries the WebSocket frames, so bytes
/// are copied to the origin's transport without re-framing
pub struct WsConnection {
    origin: Lifecycle<WsOrigin>,
}

impl WsConnection {
    /// Dial the origin and complete the WebSocket handshake.
    ///
    /// Returns the connection and the origin's upgrade response (without
    /// body). Frames the origin sent together with its response are relayed
    /// first once streaming starts. Dial and handshake failures are returned
    /// as-is; nothing is retried and no socket stays open.
    pub async fn connect(
        tls: Option<Arc<rustls::ClientConfig>>,
        request: &Request<()>,
    ) -> Result<(Self, Response), OriginError> {
        let (ws, response) = client_connect(request, tls).await?;
        let (parts, body) = response.into_parts();

        let connection = Self {
            origin: Lifecycle::new(WsOrigin { ws, body }),
        };

        Ok((connection, Response::from_parts(parts, None)))
    }
}

#[async_trait]
impl OriginConnection for WsConnection {
    async fn stream(&self, _cancel: CancellationToken, tunnel: &mut dyn TunnelIo) {
        let Some(mut origin) = self.origin.take() else {
            debug!("WebSocket origin already streamed or closed");
            return;
        };
        // The body is not needed while streaming
        drop(origin.body.take());

        tokio::select! {
            direction = pipe(tunnel, &mut origin.ws) => {
                debug!(?direction, "WebSocket origin stream finished");
            }
            _ = self.origin.closed() => {
                debug!("WebSocket origin stream interrupted by close");
            }
        }
    }

    fn close(&self) {
        if let Some(WsOrigin { ws, body }) = self.origin.close() {
            drop(body);
            drop(ws);
            debug!("Closed unused WebSocket origin connection");
        }
    }
}

/// SOCKS5 proxy; the destination is chosen per tunnel stream by the SOCKS
/// request and checked against the access policy
pub struct SocksProxyOverWsConnection {
    policy: Option<Arc<Policy>>,
}

impl SocksProxyOverWsConnection {
    /// Without policy every destination is allowed
    pub fn new(policy: Option<Arc<Policy>>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl OriginConnection for SocksProxyOverWsConnection {
    async fn stream(&self, cancel: CancellationToken, tunnel: &mut dyn TunnelIo) {
        let framed = WebSocketConn::new(cancel, tunnel).await;

        match ingress_socks::stream_net_handler(framed, self.policy.as_deref()).await {
            Ok(()) => debug!("SOCKS proxy stream finished"),
            Err(e) => info!("SOCKS proxy stream ended: {}", e),
        }
    }

    fn close(&self) {}
}
