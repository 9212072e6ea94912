//! SOCKS5 proxy for origin connections
//!
//! Parses the SOCKS5 handshake carried by a tunnel stream, checks the
//! requested destination against an IP access policy, dials it and relays.
//! Only the CONNECT command with "no authentication" is supported.

pub mod handler;
pub mod protocol;

pub use handler::{stream_net_handler, RequestHandler, DEFAULT_DIAL_TIMEOUT};
pub use protocol::{Address, Reply};

use thiserror::Error;

/// Errors that can occur during a SOCKS session
#[derive(Error, Debug)]
pub enum SocksError {
    #[error("IO error during SOCKS session: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("Client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Domain name is not valid UTF-8")]
    InvalidDomain,

    #[error("Failed to resolve {0}: {1}")]
    ResolveFailed(String, String),

    #[error("Failed to connect to {address}: {source}")]
    DialFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to {0}")]
    DialTimeout(String),
}
