//! Integration tests for dialing origin WebSocket services

use futures_util::{SinkExt, StreamExt};
use ingress_websocket::http::{header, Request, StatusCode};
use ingress_websocket::{client_connect, OriginTlsConfig, WebSocketError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as ServerRequest, Response as ServerResponse,
};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Start an echo WebSocket origin that records the request headers it saw
async fn start_echo_origin() -> (std::net::SocketAddr, Arc<Mutex<Vec<(String, String)>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |req: &ServerRequest, response: ServerResponse| {
            let mut seen = seen_clone.lock().unwrap();
            for (name, value) in req.headers() {
                seen.push((
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                ));
            }
            Ok::<_, ErrorResponse>(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_binary() || msg.is_text() {
                ws.send(msg).await.unwrap();
            }
        }
    });

    (addr, seen)
}

#[tokio::test]
async fn test_dial_plain_origin_and_echo() {
    let (addr, seen) = start_echo_origin().await;

    let eyeball_key = "dGhlIHNhbXBsZSBub25jZQ==";
    let request = Request::builder()
        .uri(format!("http://{}/chat", addr))
        .header(header::HOST, "app.example.com")
        .header(header::SEC_WEBSOCKET_KEY, eyeball_key)
        .header("X-Request-Id", "req-42")
        .body(())
        .unwrap();

    let (transport, response) = client_connect(&request, None).await.unwrap();

    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(
        response.headers()[header::SEC_WEBSOCKET_ACCEPT],
        derive_accept_key(eyeball_key.as_bytes()).as_str()
    );

    {
        let seen = seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|(name, value)| name == "x-request-id" && value == "req-42"));
        // The dialer generates its own key
        assert!(seen
            .iter()
            .any(|(name, value)| name == "sec-websocket-key" && value != eyeball_key));
        assert_eq!(
            seen.iter().filter(|(name, _)| name == "host").count(),
            1,
            "host header must not be duplicated"
        );
    }

    let mut ws = WebSocketStream::from_raw_socket(transport, Role::Client, None).await;
    ws.send(Message::Binary(b"ping".to_vec())).await.unwrap();
    match ws.next().await {
        Some(Ok(Message::Binary(data))) => assert_eq!(data, b"ping"),
        other => panic!("Expected echo, got {:?}", other),
    }
}

/// Origin that answers the upgrade and sends a text frame in the same write
async fn start_greeting_origin(greeting: &'static [u8]) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        let key = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_string())
            })
            .unwrap();

        let mut segment = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            derive_accept_key(key.as_bytes())
        )
        .into_bytes();
        segment.extend_from_slice(&[0x81, greeting.len() as u8]);
        segment.extend_from_slice(greeting);
        stream.write_all(&segment).await.unwrap();

        // Hold the socket open until the client leaves
        let mut buf = [0u8; 1024];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    addr
}

#[tokio::test]
async fn test_frame_sent_with_upgrade_response_is_kept() {
    let addr = start_greeting_origin(b"greeting").await;

    let request = Request::builder()
        .uri(format!("http://{}/", addr))
        .body(())
        .unwrap();
    let (transport, response) = client_connect(&request, None).await.unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    let mut ws = WebSocketStream::from_raw_socket(transport, Role::Client, None).await;
    let greeting = tokio::time::timeout(Duration::from_secs(1), ws.next())
        .await
        .expect("greeting frame should be delivered");
    match greeting {
        Some(Ok(Message::Text(text))) => assert_eq!(text, "greeting"),
        other => panic!("Expected greeting, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handshake_rejected_by_origin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |_req: &ServerRequest, _response: ServerResponse| {
            let mut rejection = ErrorResponse::new(None);
            *rejection.status_mut() = StatusCode::FORBIDDEN;
            Err(rejection)
        };
        let _ = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    });

    let request = Request::builder()
        .uri(format!("http://{}/", addr))
        .body(())
        .unwrap();

    match client_connect(&request, None).await {
        Err(WebSocketError::HandshakeRejected { status, .. }) => assert_eq!(status, 403),
        other => panic!("Expected rejected handshake, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_tls_handshake_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Origin that drops the connection instead of speaking TLS
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let request = Request::builder()
        .uri(format!("https://{}/", addr))
        .body(())
        .unwrap();
    let tls = OriginTlsConfig::insecure().build_client_config().unwrap();

    let result = client_connect(&request, Some(tls)).await;
    assert!(matches!(
        result,
        Err(WebSocketError::ConnectionFailed { .. })
    ));
}

#[tokio::test]
async fn test_unreachable_origin() {
    // Bind then drop to get a port with nothing listening
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let request = Request::builder()
        .uri(format!("http://{}/", addr))
        .body(())
        .unwrap();

    assert!(client_connect(&request, None).await.is_err());
}
