//! Direct-TCP origin connections against real loopback sockets

use ingress_origin::{
    CancellationToken, OriginConnection, SocksProxyOverWsConnection, TcpConnection,
    TcpOverWsConnection,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Dial a fresh loopback listener and return both ends
async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// Wait until the peer closes, draining anything it sent
async fn expect_eof(socket: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "origin socket was not closed");
}

#[tokio::test]
async fn test_hello_world_round_trip() {
    let (origin, mut service) = connected_pair().await;
    let connection = TcpConnection::new(origin);

    let service_task = tokio::spawn(async move {
        let mut buf = [0u8; 5];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        service.write_all(b"world").await.unwrap();
        // Closing the write side ends the stream
        service.shutdown().await.unwrap();
        service
    });

    let (mut tunnel, mut eyeball) = tokio::io::duplex(1024);
    let streaming = tokio::spawn(async move {
        connection
            .stream(CancellationToken::new(), &mut tunnel)
            .await;
        connection.close();
    });

    eyeball.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    eyeball.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"world");

    tokio::time::timeout(Duration::from_secs(5), streaming)
        .await
        .expect("stream should return after the origin closes its write side")
        .unwrap();

    let mut service = service_task.await.unwrap();
    expect_eof(&mut service).await;
}

#[tokio::test]
async fn test_close_interrupts_stream() {
    let (origin, mut service) = connected_pair().await;
    let connection = Arc::new(TcpConnection::new(origin));

    // Neither side sends anything; the copy would block forever
    let (mut tunnel, _eyeball) = tokio::io::duplex(1024);
    let streaming = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .stream(CancellationToken::new(), &mut tunnel)
                .await;
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    connection.close();

    tokio::time::timeout(Duration::from_secs(1), streaming)
        .await
        .expect("close should make stream return")
        .unwrap();

    expect_eof(&mut service).await;
}

#[tokio::test]
async fn test_close_without_stream() {
    let (origin, mut service) = connected_pair().await;
    let connection = TcpConnection::new(origin);

    connection.close();
    expect_eof(&mut service).await;

    // Closing twice is harmless
    connection.close();
}

#[tokio::test]
async fn test_tcp_over_ws_close_without_stream() {
    let (origin, mut service) = connected_pair().await;
    let connection = TcpOverWsConnection::new(origin);

    connection.close();
    expect_eof(&mut service).await;
}

#[tokio::test]
async fn test_socks_close_is_noop() {
    let connection = SocksProxyOverWsConnection::new(None);
    connection.close();
    connection.close();
}

#[tokio::test]
async fn test_stream_after_close_returns_immediately() {
    let (origin, _service) = connected_pair().await;
    let connection = TcpConnection::new(origin);
    connection.close();

    let (mut tunnel, _eyeball) = tokio::io::duplex(1024);
    tokio::time::timeout(
        Duration::from_secs(1),
        connection.stream(CancellationToken::new(), &mut tunnel),
    )
    .await
    .expect("stream after close must not block");
}

#[tokio::test]
async fn test_second_stream_returns_immediately() {
    let (origin, mut service) = connected_pair().await;
    let connection = TcpConnection::new(origin);

    let (mut tunnel, eyeball) = tokio::io::duplex(1024);
    drop(eyeball);
    connection
        .stream(CancellationToken::new(), &mut tunnel)
        .await;

    let (mut tunnel, _eyeball) = tokio::io::duplex(1024);
    tokio::time::timeout(
        Duration::from_secs(1),
        connection.stream(CancellationToken::new(), &mut tunnel),
    )
    .await
    .expect("a second stream call must not block");

    connection.close();
    expect_eof(&mut service).await;
}

#[tokio::test]
async fn test_already_cancelled_token() {
    let (origin, mut service) = connected_pair().await;
    let connection = TcpConnection::new(origin);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let (mut tunnel, mut eyeball) = tokio::io::duplex(1024);
    let streaming = tokio::spawn(async move {
        connection.stream(cancel, &mut tunnel).await;
    });

    // Raw TCP ignores the token; the stream still relays
    eyeball.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    service.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(eyeball);
    tokio::time::timeout(Duration::from_secs(5), streaming)
        .await
        .expect("stream should end once the tunnel closes")
        .unwrap();
}
