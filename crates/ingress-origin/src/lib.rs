//! Origin side of the tunnel
//!
//! Every tunnel stream accepted for an ingress rule gets an
//! [`OriginConnection`] that bridges it to the rule's origin service:
//!
//! - [`TcpConnection`]: raw TCP
//! - [`TcpOverWsConnection`]: raw TCP origin, WebSocket-framed tunnel
//! - [`WsConnection`]: WebSocket origin, frames passed through untouched
//! - [`SocksProxyOverWsConnection`]: SOCKS5 proxy behind an IP access policy

pub mod connection;
pub mod error;
pub mod ingress;
mod lifecycle;
pub mod service;
pub mod stream;

pub use connection::{
    DefaultStreamHandler, OriginConnection, SocksProxyOverWsConnection, StreamHandler,
    TcpConnection, TcpOverWsConnection, WsConnection,
};
pub use error::OriginError;
pub use ingress::{ConfigError, Ingress, IngressRule, IngressRuleConfig};
pub use service::{
    Established, OriginRequest, OriginRequestConfig, OriginService, ServiceConfig,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use stream::{pipe, Direction, TunnelIo};

pub use ingress_websocket::{http, Response};
pub use tokio_util::sync::CancellationToken;
