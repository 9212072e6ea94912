//! WebSocket plumbing for origin connections
//!
//! - [`WebSocketConn`]: exposes a WebSocket-framed tunnel stream as plain
//!   bytes (`AsyncRead + AsyncWrite`)
//! - [`client_connect`]: dials an origin WebSocket service over TCP or TLS
//! - [`OriginTlsConfig`]: rustls client configuration for origin dials
//! - [`HandshakeStream`]: origin transport that replays bytes read past the
//!   upgrade response

pub mod client;
pub mod config;
pub mod conn;
pub mod transport;

pub use client::client_connect;
pub use config::OriginTlsConfig;
pub use conn::WebSocketConn;
pub use transport::{HandshakeStream, OriginWebSocket};

pub use tokio_tungstenite::tungstenite::handshake::client::Response;
pub use tokio_tungstenite::tungstenite::http;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// WebSocket errors
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Origin {url} rejected the WebSocket handshake with status {status}")]
    HandshakeRejected { url: String, status: u16 },

    #[error("Failed to connect to origin {url}: {source}")]
    ConnectionFailed {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
}

impl WebSocketError {
    pub(crate) fn from_handshake(url: &str, err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => WebSocketError::HandshakeRejected {
                url: url.to_string(),
                status: response.status().as_u16(),
            },
            source => WebSocketError::ConnectionFailed {
                url: url.to_string(),
                source,
            },
        }
    }
}
