//! Local edge: accepts TCP connections and treats each one as a tunnel
//! stream for a single ingress rule.
//!
//! Raw TCP services get the socket as-is. For WebSocket-framed services the
//! client first sends an HTTP upgrade request; `websocket` services answer
//! it with the origin's handshake response, the other framed services with a
//! locally generated `101 Switching Protocols`.

use anyhow::{bail, Context, Result};
use ingress_origin::http::{HeaderName, HeaderValue, Method, Request};
use ingress_origin::{CancellationToken, IngressRule, OriginService, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Maximum number of headers in an upgrade request
const MAX_HEADERS: usize = 100;

/// Maximum size of an upgrade request head
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Serves one ingress rule on a local listener
#[derive(Debug, Clone)]
pub struct EdgeServer {
    rule: Arc<IngressRule>,
}

impl EdgeServer {
    pub fn new(rule: IngressRule) -> Self {
        Self {
            rule: Arc::new(rule),
        }
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        info!(
            listen = %local_addr,
            service = self.rule.service.kind(),
            "Edge listener started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Edge listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let rule = self.rule.clone();
                    let cancel = shutdown.child_token();
                    let span = info_span!(
                        "connection",
                        connection_id = %Uuid::new_v4(),
                        peer = %peer,
                        service = rule.service.kind()
                    );

                    tokio::spawn(
                        async move {
                            if let Err(e) = serve_connection(&rule, socket, peer, cancel).await {
                                warn!("Connection failed: {:#}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }
    }
}

/// Whether the service expects WebSocket frames on the tunnel stream
fn expects_upgrade(service: &OriginService) -> bool {
    !matches!(service, OriginService::Tcp { .. })
}

async fn serve_connection(
    rule: &IngressRule,
    socket: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    debug!("Accepted connection from {}", peer);

    // Bytes buffered past the request head are still delivered to the origin
    let mut tunnel = BufReader::new(socket);

    let request = if expects_upgrade(&rule.service) {
        read_upgrade_request(&mut tunnel).await?
    } else {
        Request::new(())
    };

    let established = match rule.establish(&request).await {
        Ok(established) => established,
        Err(e) => {
            if expects_upgrade(&rule.service) {
                let _ = tunnel
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
            return Err(e).context("Failed to connect to origin");
        }
    };

    match &established.response {
        Some(response) => write_response_head(&mut tunnel, response).await?,
        None if expects_upgrade(&rule.service) => {
            write_switching_protocols(&mut tunnel, &request).await?
        }
        None => {}
    }

    info!("Streaming to origin");
    established.connection.stream(cancel, &mut tunnel).await;
    established.connection.close();
    info!("Stream closed");

    Ok(())
}

/// Read and parse the client's HTTP upgrade request head.
///
/// Reads at most `MAX_HEAD_LEN + 1` bytes; anything behind the head stays
/// buffered in `tunnel`.
async fn read_upgrade_request<R>(tunnel: &mut R) -> Result<Request<()>>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = (&mut *tunnel).take((MAX_HEAD_LEN + 1) as u64);
    let mut head = Vec::with_capacity(1024);
    loop {
        let n = limited
            .read_until(b'\n', &mut head)
            .await
            .context("Failed to read request head")?;
        if head.ends_with(b"\r\n\r\n") || head == b"\r\n" {
            break;
        }
        if head.len() > MAX_HEAD_LEN {
            bail!("Request head larger than {} bytes", MAX_HEAD_LEN);
        }
        if n == 0 {
            bail!("Connection closed before the request head was complete");
        }
    }

    parse_request_head(&head)
}

fn parse_request_head(head: &[u8]) -> Result<Request<()>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(head).context("Malformed HTTP request head")? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => bail!("Incomplete HTTP request head"),
    }

    let method = parsed.method.unwrap_or("GET");
    let path = parsed.path.unwrap_or("/");

    let mut request = Request::new(());
    *request.method_mut() =
        Method::from_bytes(method.as_bytes()).context("Invalid request method")?;
    *request.uri_mut() = path.parse().context("Invalid request path")?;

    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .with_context(|| format!("Invalid header name: {}", header.name))?;
        let value = HeaderValue::from_bytes(header.value)
            .with_context(|| format!("Invalid value for header {}", header.name))?;
        request.headers_mut().append(name, value);
    }

    Ok(request)
}

async fn write_response_head(tunnel: &mut BufReader<TcpStream>, response: &Response) -> Result<()> {
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    tunnel
        .write_all(head.as_bytes())
        .await
        .context("Failed to write response head")?;
    tunnel.flush().await?;
    Ok(())
}

async fn write_switching_protocols(
    tunnel: &mut BufReader<TcpStream>,
    request: &Request<()>,
) -> Result<()> {
    let key = request
        .headers()
        .get("sec-websocket-key")
        .context("Upgrade request has no Sec-WebSocket-Key")?;

    let head = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    );

    tunnel
        .write_all(head.as_bytes())
        .await
        .context("Failed to write handshake response")?;
    tunnel.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_head() {
        let head = b"GET /chat?room=1 HTTP/1.1\r\n\
            Host: app.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";

        let request = parse_request_head(head).unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/chat");
        assert_eq!(request.uri().query(), Some("room=1"));
        assert_eq!(request.headers()["host"], "app.example.com");
        assert_eq!(
            request.headers()["sec-websocket-key"],
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
    }

    #[test]
    fn test_parse_incomplete_head() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost: a\r\n").is_err());
        assert!(parse_request_head(b"\x00\x01garbage\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_read_upgrade_request_keeps_trailing_bytes() {
        let mut tunnel =
            BufReader::new(&b"GET /ws HTTP/1.1\r\nHost: a\r\n\r\nearly frame"[..]);

        let request = read_upgrade_request(&mut tunnel).await.unwrap();
        assert_eq!(request.uri().path(), "/ws");

        let mut rest = Vec::new();
        tunnel.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"early frame");
    }

    #[tokio::test]
    async fn test_read_upgrade_request_is_bounded_without_newline() {
        // Endless input with no line break
        let mut tunnel = BufReader::new(tokio::io::repeat(b'A'));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            read_upgrade_request(&mut tunnel),
        )
        .await
        .expect("reading must stop at the head size limit");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("larger than"), "{:#}", err);
    }

    #[tokio::test]
    async fn test_read_upgrade_request_eof() {
        let mut tunnel = BufReader::new(&b"GET / HTTP/1.1\r\nHost"[..]);
        let err = read_upgrade_request(&mut tunnel).await.unwrap_err();
        assert!(err.to_string().contains("closed"), "{:#}", err);
    }

    #[test]
    fn test_expects_upgrade() {
        assert!(!expects_upgrade(&OriginService::Tcp {
            address: "127.0.0.1:22".to_string()
        }));
        assert!(expects_upgrade(&OriginService::TcpOverWebSocket {
            address: "127.0.0.1:22".to_string()
        }));
        assert!(expects_upgrade(&OriginService::SocksProxy { policy: None }));
    }
}
