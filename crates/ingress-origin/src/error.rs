use ingress_ipaccess::PolicyError;
use ingress_websocket::WebSocketError;
use thiserror::Error;

/// Errors raised while establishing an origin connection
#[derive(Error, Debug)]
pub enum OriginError {
    #[error("Failed to connect to origin {address}: {source}")]
    Dial {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to origin {address}")]
    DialTimeout { address: String },

    #[error("WebSocket origin error: {0}")]
    WebSocket(#[from] WebSocketError),

    #[error("Invalid access policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("Invalid origin service: {0}")]
    InvalidService(String),
}
