//! Client-side WebSocket dial towards an origin service

use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Response;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue, Request, Uri};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};

use crate::config::OriginTlsConfig;
use crate::transport::{HandshakeStream, OriginWebSocket};
use crate::WebSocketError;

/// Handshake headers generated by the dialer itself
const HANDSHAKE_HEADERS: [HeaderName; 6] = [
    header::HOST,
    header::UPGRADE,
    header::CONNECTION,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
];

/// Dial the origin described by `request` and complete the WebSocket handshake.
///
/// # Arguments
/// * `request` - Upgrade request from the tunnel; its URI selects the origin
/// * `tls` - rustls configuration for `https`/`wss` origins (defaults when `None`)
///
/// # Returns
/// The origin transport, positioned right after the upgrade response, and
/// that response. When the request carried a `Sec-WebSocket-Key`, the
/// response's `Sec-WebSocket-Accept` matches that key.
pub async fn client_connect(
    request: &Request<()>,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Result<(OriginWebSocket, Response), WebSocketError> {
    let url = websocket_url(request)?;

    let mut ws_request = url
        .as_str()
        .into_client_request()
        .map_err(|e| WebSocketError::InvalidRequest(format!("{}: {}", url, e)))?;

    for (name, value) in request.headers() {
        if HANDSHAKE_HEADERS.contains(name) {
            continue;
        }
        ws_request.headers_mut().append(name.clone(), value.clone());
    }

    debug!(origin = %url, "Dialing origin WebSocket");

    let transport = dial(ws_request.uri(), tls)
        .await
        .map_err(|e| WebSocketError::from_handshake(&url, e))?;
    let mut transport = HandshakeStream::new(transport);

    let (_, mut response) =
        tokio_tungstenite::client_async_with_config(ws_request, &mut transport, None)
            .await
            .map_err(|e| WebSocketError::from_handshake(&url, e))?;
    transport.finish_handshake();

    if let Some(key) = request.headers().get(header::SEC_WEBSOCKET_KEY) {
        let accept = derive_accept_key(key.as_bytes());
        let accept = HeaderValue::from_str(&accept)
            .map_err(|e| WebSocketError::InvalidRequest(e.to_string()))?;
        response
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    }

    info!(
        origin = %url,
        status = response.status().as_u16(),
        early_bytes = transport.early_data().len(),
        "WebSocket connection established to origin"
    );

    Ok((transport, response))
}

/// Open the TCP connection, wrapped in TLS for `wss`
async fn dial(
    uri: &Uri,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Result<MaybeTlsStream<TcpStream>, WsError> {
    let secure = uri.scheme_str() == Some("wss");
    let host = uri
        .host()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .ok_or(WsError::Url(
            tokio_tungstenite::tungstenite::error::UrlError::NoHostName,
        ))?;
    let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

    let tcp_stream = TcpStream::connect((host, port)).await?;
    if !secure {
        return Ok(MaybeTlsStream::Plain(tcp_stream));
    }

    let config = match tls {
        Some(config) => config,
        None => OriginTlsConfig::default()
            .build_client_config()
            .map_err(|e| WsError::Io(std::io::Error::other(e.to_string())))?,
    };
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| WsError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

    let tls_stream = TlsConnector::from(config)
        .connect(server_name, tcp_stream)
        .await?;

    Ok(MaybeTlsStream::Rustls(tls_stream))
}

/// Map the request URI onto a `ws://` or `wss://` URL
fn websocket_url(request: &Request<()>) -> Result<String, WebSocketError> {
    let uri: &Uri = request.uri();

    let scheme = match uri.scheme_str() {
        Some("http") | Some("ws") => "ws",
        Some("https") | Some("wss") => "wss",
        Some(other) => {
            return Err(WebSocketError::InvalidRequest(format!(
                "Unsupported scheme '{}'",
                other
            )))
        }
        None => {
            return Err(WebSocketError::InvalidRequest(format!(
                "Request URI '{}' has no scheme",
                uri
            )))
        }
    };

    let authority = uri.authority().ok_or_else(|| {
        WebSocketError::InvalidRequest(format!("Request URI '{}' has no host", uri))
    })?;

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    Ok(format!("{}://{}{}", scheme, authority, path))
}
