//! Origin services an ingress rule can point at, and how each one is
//! connected to

use ingress_ipaccess::{Policy, PolicyConfig};
use ingress_websocket::http::uri::PathAndQuery;
use ingress_websocket::http::{Request, Uri};
use ingress_websocket::{OriginTlsConfig, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::connection::{
    OriginConnection, SocksProxyOverWsConnection, TcpConnection, TcpOverWsConnection,
    WsConnection,
};
use crate::OriginError;

/// Default timeout for dialing an origin
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn default_connect_timeout_seconds() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

/// Serialized service definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServiceConfig {
    /// Raw TCP, bytes relayed unchanged
    #[serde(rename = "tcp")]
    Tcp { address: String },

    /// Raw TCP origin, tunnel traffic carried in WebSocket frames
    #[serde(rename = "tcp_over_websocket")]
    TcpOverWebSocket { address: String },

    /// WebSocket origin (`http`, `https`, `ws` or `wss` URL)
    #[serde(rename = "websocket")]
    WebSocket { url: String },

    /// SOCKS5 proxy restricted by an optional access policy
    #[serde(rename = "socks_proxy")]
    SocksProxy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip_rules: Option<PolicyConfig>,
    },
}

/// Serialized per-rule origin settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginRequestConfig {
    #[serde(flatten)]
    pub tls: OriginTlsConfig,

    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

impl Default for OriginRequestConfig {
    fn default() -> Self {
        Self {
            tls: OriginTlsConfig::default(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }
}

/// Origin settings ready for use
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub connect_timeout: Duration,
    /// Only built for WebSocket services
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for OriginRequest {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: None,
        }
    }
}

impl OriginRequest {
    /// Build settings for `service`; the TLS config is only loaded when the
    /// service can use it
    pub fn build(config: &OriginRequestConfig, service: &OriginService) -> Result<Self, OriginError> {
        let tls = match service {
            OriginService::WebSocket { .. } => Some(config.tls.build_client_config()?),
            _ => None,
        };

        Ok(Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
            tls,
        })
    }
}

/// A validated origin service
#[derive(Debug, Clone)]
pub enum OriginService {
    Tcp { address: String },
    TcpOverWebSocket { address: String },
    WebSocket { url: Uri },
    /// The policy is shared by every connection of the service
    SocksProxy { policy: Option<Arc<Policy>> },
}

impl TryFrom<&ServiceConfig> for OriginService {
    type Error = OriginError;

    fn try_from(config: &ServiceConfig) -> Result<Self, Self::Error> {
        match config {
            ServiceConfig::Tcp { address } => Ok(OriginService::Tcp {
                address: validate_address(address)?,
            }),
            ServiceConfig::TcpOverWebSocket { address } => Ok(OriginService::TcpOverWebSocket {
                address: validate_address(address)?,
            }),
            ServiceConfig::WebSocket { url } => Ok(OriginService::WebSocket {
                url: validate_url(url)?,
            }),
            ServiceConfig::SocksProxy { ip_rules } => {
                let policy = match ip_rules {
                    Some(rules) => Some(Arc::new(Policy::try_from(rules)?)),
                    None => None,
                };
                Ok(OriginService::SocksProxy { policy })
            }
        }
    }
}

fn validate_address(address: &str) -> Result<String, OriginError> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(address.to_string())
        }
        _ => Err(OriginError::InvalidService(format!(
            "'{}' is not a host:port address",
            address
        ))),
    }
}

fn validate_url(url: &str) -> Result<Uri, OriginError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| OriginError::InvalidService(format!("'{}': {}", url, e)))?;

    match uri.scheme_str() {
        Some("http") | Some("https") | Some("ws") | Some("wss") => {}
        _ => {
            return Err(OriginError::InvalidService(format!(
                "'{}' must be an http, https, ws or wss URL",
                url
            )))
        }
    }

    if uri.authority().is_none() {
        return Err(OriginError::InvalidService(format!("'{}' has no host", url)));
    }

    Ok(uri)
}

/// An origin connection ready to stream
pub struct Established {
    pub connection: Box<dyn OriginConnection>,
    /// The origin's upgrade response, for WebSocket services
    pub response: Option<Response>,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

impl OriginService {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            OriginService::Tcp { .. } => "tcp",
            OriginService::TcpOverWebSocket { .. } => "tcp_over_websocket",
            OriginService::WebSocket { .. } => "websocket",
            OriginService::SocksProxy { .. } => "socks_proxy",
        }
    }

    /// Connect to the origin for one tunnel stream.
    ///
    /// TCP services dial now. WebSocket services dial and complete the
    /// handshake, using the service URL's scheme and host with the path and
    /// headers of `request`. SOCKS services dial per SOCKS request later.
    pub async fn establish(
        &self,
        origin_request: &OriginRequest,
        request: &Request<()>,
    ) -> Result<Established, OriginError> {
        match self {
            OriginService::Tcp { address } => {
                let origin = dial(address, origin_request.connect_timeout).await?;
                Ok(Established {
                    connection: Box::new(TcpConnection::new(origin)),
                    response: None,
                })
            }
            OriginService::TcpOverWebSocket { address } => {
                let origin = dial(address, origin_request.connect_timeout).await?;
                Ok(Established {
                    connection: Box::new(TcpOverWsConnection::new(origin)),
                    response: None,
                })
            }
            OriginService::WebSocket { url } => {
                let ws_request = websocket_request(url, request)?;
                let connect = WsConnection::connect(origin_request.tls.clone(), &ws_request);

                let (connection, response) =
                    match tokio::time::timeout(origin_request.connect_timeout, connect).await {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(OriginError::DialTimeout {
                                address: url.to_string(),
                            })
                        }
                    };

                Ok(Established {
                    connection: Box::new(connection),
                    response: Some(response),
                })
            }
            OriginService::SocksProxy { policy } => Ok(Established {
                connection: Box::new(SocksProxyOverWsConnection::new(policy.clone())),
                response: None,
            }),
        }
    }
}

async fn dial(address: &str, timeout: Duration) -> Result<TcpStream, OriginError> {
    debug!(origin = %address, "Dialing TCP origin");

    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            info!(origin = %address, "Connected to TCP origin");
            Ok(stream)
        }
        Ok(Err(source)) => Err(OriginError::Dial {
            address: address.to_string(),
            source,
        }),
        Err(_) => Err(OriginError::DialTimeout {
            address: address.to_string(),
        }),
    }
}

/// Point the tunnel's upgrade request at the service URL
fn websocket_request(url: &Uri, request: &Request<()>) -> Result<Request<()>, OriginError> {
    let mut parts = url.clone().into_parts();
    parts.path_and_query = request
        .uri()
        .path_and_query()
        .cloned()
        .or(parts.path_and_query)
        .or_else(|| Some(PathAndQuery::from_static("/")));

    let uri = Uri::from_parts(parts)
        .map_err(|e| OriginError::InvalidService(format!("{}: {}", url, e)))?;

    let mut ws_request = Request::new(());
    *ws_request.method_mut() = request.method().clone();
    *ws_request.uri_mut() = uri;
    *ws_request.headers_mut() = request.headers().clone();
    Ok(ws_request)
}
