//! End-to-end tests: a server-role connection and a client-role
//! connection talking over an in-memory duplex pipe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use portico_ws::{
    connect_with_stream, Accepted, Callbacks, ClientRequest, ConnectionRegistry, ConnectionStatus,
    ExtensionBinding, Message, OpCode, PerMessageDeflate, RegistryConfig, ReservedBit,
    UserData, WebSocketConfig, WebSocketHandle, WebSocketUpgrade, WsError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

/// Reads an upgrade request head from `io`.
async fn read_request(io: &mut DuplexStream) -> HeaderMap {
    let mut buf = BytesMut::new();
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        assert_ne!(io.read_buf(&mut buf).await.unwrap(), 0);
    }
    let text = String::from_utf8(buf.to_vec()).unwrap();
    let mut headers = HeaderMap::new();
    for line in text.split("\r\n").skip(1).filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').unwrap();
        headers.append(
            HeaderName::from_bytes(name.trim().as_bytes()).unwrap(),
            HeaderValue::from_str(value.trim()).unwrap(),
        );
    }
    headers
}

async fn switch_protocols(io: &mut DuplexStream, headers: HeaderMap) {
    let mut response = b"HTTP/1.1 101 Switching Protocols\r\n".to_vec();
    for (name, value) in &headers {
        response.extend_from_slice(name.as_str().as_bytes());
        response.extend_from_slice(b": ");
        response.extend_from_slice(value.as_bytes());
        response.extend_from_slice(b"\r\n");
    }
    response.extend_from_slice(b"\r\n");
    io.write_all(&response).await.unwrap();
}

/// Reads one upgrade request from `io`, answers it and starts the
/// server side of the connection, the way a listener does.
async fn serve(
    mut io: DuplexStream,
    upgrade: WebSocketUpgrade,
    registry: Option<Arc<ConnectionRegistry>>,
) -> Result<WebSocketHandle, WsError> {
    let headers = read_request(&mut io).await;

    let slot = match registry.map(|r| r.reserve()).transpose() {
        Ok(slot) => slot,
        Err(e) => {
            io.write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            return Err(e);
        }
    };

    let accepted = match upgrade.accept(&Method::GET, Version::HTTP_11, &headers) {
        Ok(accepted) => accepted,
        Err(e) => {
            io.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 3\r\n\r\nbad")
                .await
                .unwrap();
            return Err(e);
        }
    };

    switch_protocols(&mut io, accepted.response_headers()).await;
    Ok(upgrade.start(io, accepted, slot))
}

async fn pair(
    upgrade: WebSocketUpgrade,
    request: ClientRequest,
) -> (WebSocketHandle, WebSocketHandle) {
    let (server_io, client_io) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(serve(server_io, upgrade, None));
    let client = connect_with_stream(client_io, request).await.unwrap();
    let server = server.await.unwrap().unwrap();
    (server, client)
}

fn echo() -> WebSocketUpgrade {
    WebSocketUpgrade::new().on_message(
        |ws, msg, _| async move {
            if msg.opcode.is_data() {
                let _ = ws.send_message(msg.opcode, msg.payload).await;
            }
        },
        None,
    )
}

/// A client request that forwards every received message to a channel.
fn collecting(url: &str) -> (ClientRequest, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let request = ClientRequest::new(url).unwrap().callbacks(Callbacks::new().on_message(
        move |_, msg, _| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        },
        None,
    ));
    (request, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (request, mut rx) = collecting("ws://localhost/echo");
    let (server, client) = pair(echo(), request).await;

    client.send_text("hello").await.unwrap();
    client.send_binary(vec![1_u8, 2, 3]).await.unwrap();

    let text = next(&mut rx).await;
    assert_eq!(text.as_text(), Some("hello"));
    assert!(!text.masked);
    let binary = next(&mut rx).await;
    assert_eq!(binary.opcode, OpCode::Binary);
    assert_eq!(&binary.payload[..], &[1, 2, 3]);

    // Client frames arrive masked at the server.
    let received = server.drain_incoming();
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|m| m.masked));

    client.close().await.unwrap();
    assert_eq!(client.wait_closed(WAIT).await, ConnectionStatus::Closed);
    assert_eq!(server.wait_closed(WAIT).await, ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_fragmented_message_is_reassembled() {
    let (request, mut rx) = collecting("ws://localhost/");
    let (_server, client) = pair(echo(), request).await;

    let payload: Vec<u8> = (0..=255_u8).cycle().take(10_000).collect();
    client
        .send_fragmented(OpCode::Binary, payload.clone(), 1000)
        .await
        .unwrap();

    let message = next(&mut rx).await;
    assert_eq!(message.payload, Bytes::from(payload));
}

#[tokio::test]
async fn test_configured_fragment_size_applies_to_every_send() {
    let (request, mut rx) = collecting("ws://localhost/");
    let request = request.config(WebSocketConfig::default().fragment_size(3));
    let (_server, client) = pair(echo(), request).await;

    client.send_text("fragmented text").await.unwrap();
    assert_eq!(next(&mut rx).await.as_text(), Some("fragmented text"));
}

#[tokio::test]
async fn test_ping_gets_empty_pong() {
    let (request, mut rx) = collecting("ws://localhost/");
    let (_server, client) = pair(echo(), request).await;

    client.ping(&b"are you there"[..]).await.unwrap();
    let pong = next(&mut rx).await;
    assert_eq!(pong.opcode, OpCode::Pong);
    assert!(pong.payload.is_empty());
}

#[tokio::test]
async fn test_close_runs_callbacks_once_on_both_sides() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = |closes: &Arc<AtomicUsize>| {
        let closes = Arc::clone(closes);
        move |_: WebSocketHandle, _: Option<UserData>| {
            let closes = Arc::clone(&closes);
            async move {
                closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    };

    let upgrade = echo().on_close(counter(&closes), None);
    let request = ClientRequest::new("ws://localhost/")
        .unwrap()
        .callbacks(Callbacks::new().on_close(counter(&closes), None));
    let (server, client) = pair(upgrade, request).await;

    server.close_with(portico_ws::CloseCode::GoingAway, "restart").await.unwrap();
    assert_eq!(server.wait_closed(WAIT).await, ConnectionStatus::Closed);
    assert_eq!(client.wait_closed(WAIT).await, ConnectionStatus::Closed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 2);

    // A second close is a no-op error, not a second callback.
    assert!(server.close().await.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_protocol_negotiation() {
    let upgrade = echo().protocol("v2").protocol("v1");
    let request = ClientRequest::new("ws://localhost/").unwrap().protocol("v1").protocol("v2");
    let (server, client) = pair(upgrade, request).await;
    assert_eq!(server.protocol(), Some("v2"));
    assert_eq!(client.protocol(), Some("v2"));
}

#[tokio::test]
async fn test_protocol_mismatch_is_rejected() {
    let (server_io, client_io) = tokio::io::duplex(1 << 16);
    let upgrade = echo().protocol("v2");
    let server = tokio::spawn(serve(server_io, upgrade, None));

    let request = ClientRequest::new("ws://localhost/").unwrap().protocol("v9");
    let err = connect_with_stream(client_io, request).await.unwrap_err();
    assert!(matches!(err, WsError::Rejected { status: 400 }));
    assert!(server.await.unwrap().unwrap_err().is_bad_request());
}

#[tokio::test]
async fn test_custom_extension_end_to_end() {
    fn xor() -> ExtensionBinding {
        ExtensionBinding::new("x-xor", ReservedBit::Rsv3)
            .encoder(|_, p| Ok(p.iter().map(|b| b ^ 0xAA).collect::<Vec<_>>().into()))
            .decoder(|_, p| Ok(p.iter().map(|b| b ^ 0xAA).collect::<Vec<_>>().into()))
    }

    let (request, mut rx) = collecting("ws://localhost/");
    let (server, client) = pair(echo().extension(xor()), request.extension(xor())).await;
    assert_eq!(server.extensions(), ["x-xor".to_string()]);
    assert_eq!(client.extensions(), ["x-xor".to_string()]);

    client.send_text("secret").await.unwrap();
    assert_eq!(next(&mut rx).await.as_text(), Some("secret"));
}

#[tokio::test]
async fn test_permessage_deflate_end_to_end() {
    let (request, mut rx) = collecting("ws://localhost/");
    let request = request.extension(PerMessageDeflate::client());
    let (server, client) = pair(echo().extension(PerMessageDeflate::server()), request).await;
    assert_eq!(server.extensions(), ["permessage-deflate".to_string()]);

    let text = "compress me ".repeat(200);
    client.send_text(text.clone()).await.unwrap();
    assert_eq!(next(&mut rx).await.as_text(), Some(text.as_str()));
    client.send_text("again").await.unwrap();
    assert_eq!(next(&mut rx).await.as_text(), Some("again"));
}

#[tokio::test]
async fn test_registry_shutdown_waits_for_every_close_callback() {
    let registry = ConnectionRegistry::new(RegistryConfig::default());
    let closes = Arc::new(AtomicUsize::new(0));
    let mut clients = Vec::new();

    for _ in 0..5 {
        let closes = Arc::clone(&closes);
        let upgrade = echo().on_close(
            move |_, _| {
                let closes = Arc::clone(&closes);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    closes.fetch_add(1, Ordering::SeqCst);
                }
            },
            None,
        );
        let (server_io, client_io) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(serve(server_io, upgrade, Some(Arc::clone(&registry))));
        let client = connect_with_stream(client_io, ClientRequest::new("ws://localhost/").unwrap())
            .await
            .unwrap();
        server.await.unwrap().unwrap();
        clients.push(client);
    }
    assert_eq!(registry.len(), 5);

    assert!(registry.shutdown_timeout(Duration::from_secs(5)).await);
    assert_eq!(closes.load(Ordering::SeqCst), 5);
    assert!(registry.is_empty());
    assert_eq!(registry.stats().total_closed, 5);
    for client in &clients {
        assert_eq!(client.wait_closed(WAIT).await, ConnectionStatus::Closed);
    }

    // No new connections once shut down.
    assert!(registry.check_capacity().is_err());
}

#[tokio::test]
async fn test_connection_limit() {
    let registry = ConnectionRegistry::new(RegistryConfig::new().max_connections(1));

    let (server_io, client_io) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(serve(server_io, echo(), Some(Arc::clone(&registry))));
    let _client = connect_with_stream(client_io, ClientRequest::new("ws://localhost/").unwrap())
        .await
        .unwrap();
    server.await.unwrap().unwrap();

    let (server_io, client_io) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(serve(server_io, echo(), Some(Arc::clone(&registry))));
    let second = connect_with_stream(client_io, ClientRequest::new("ws://localhost/").unwrap()).await;
    assert!(matches!(second.unwrap_err(), WsError::Rejected { status: 503 }));
    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, WsError::ConnectionLimitReached(_)));
    assert_eq!(registry.stats().total_rejected, 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_concurrent_upgrades_respect_limit() {
    let registry = ConnectionRegistry::new(RegistryConfig::new().max_connections(1));

    let attempts: Vec<_> = (0..6)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let (server_io, client_io) = tokio::io::duplex(1 << 16);
                let server = tokio::spawn(serve(server_io, echo(), Some(registry)));
                let client =
                    connect_with_stream(client_io, ClientRequest::new("ws://localhost/").unwrap()).await;
                (server.await.unwrap(), client)
            })
        })
        .collect();

    let mut open = Vec::new();
    for attempt in attempts {
        let (server, client) = attempt.await.unwrap();
        match (server, client) {
            (Ok(server), Ok(client)) => open.push((server, client)),
            (Err(e), Err(rejected)) => {
                assert!(matches!(e, WsError::ConnectionLimitReached(_)));
                assert!(matches!(rejected, WsError::Rejected { status: 503 }));
            }
            _ => panic!("server and client disagree about the upgrade"),
        }
    }

    assert_eq!(open.len(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.stats().total_rejected, 5);
}

#[tokio::test]
async fn test_panicking_close_callback_still_leaves_registry() {
    let registry = ConnectionRegistry::new(RegistryConfig::default());
    let upgrade = echo().on_close(
        |_, _| async move {
            panic!("close callback failed");
        },
        None,
    );

    let (server_io, client_io) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(serve(server_io, upgrade, Some(Arc::clone(&registry))));
    let client = connect_with_stream(client_io, ClientRequest::new("ws://localhost/").unwrap())
        .await
        .unwrap();
    let server = server.await.unwrap().unwrap();
    assert_eq!(registry.len(), 1);

    client.close().await.unwrap();
    assert_eq!(server.wait_closed(WAIT).await, ConnectionStatus::Closed);

    assert!(tokio::time::timeout(Duration::from_secs(2), registry.wait_empty())
        .await
        .is_ok());
    assert_eq!(registry.stats().total_closed, 1);
    assert!(registry.shutdown_timeout(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_connection_started_during_shutdown_is_closed() {
    let registry = ConnectionRegistry::new(RegistryConfig::default());
    let (mut server_io, client_io) = tokio::io::duplex(1 << 16);
    let client = tokio::spawn(connect_with_stream(
        client_io,
        ClientRequest::new("ws://localhost/").unwrap(),
    ));

    let headers = read_request(&mut server_io).await;
    let upgrade = echo();
    let accepted = upgrade.accept(&Method::GET, Version::HTTP_11, &headers).unwrap();
    let slot = registry.reserve().unwrap();

    // Shutdown starts while the upgrade is still in flight.
    let shutdown = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.shutdown_timeout(Duration::from_secs(5)).await })
    };
    while registry.is_accepting() {
        tokio::task::yield_now().await;
    }
    assert!(!shutdown.is_finished());

    switch_protocols(&mut server_io, accepted.response_headers()).await;
    let server = upgrade.start(server_io, accepted, Some(slot));
    let client = client.await.unwrap().unwrap();

    assert_eq!(server.wait_closed(WAIT).await, ConnectionStatus::Closed);
    assert_eq!(client.wait_closed(WAIT).await, ConnectionStatus::Closed);
    assert!(shutdown.await.unwrap());
    assert!(registry.is_empty());
    assert_eq!(registry.stats().total_accepted, 1);
}

#[tokio::test]
async fn test_callbacks_receive_route_user_data() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let data: portico_router::UserData = Arc::new(String::from("room-7"));
    let upgrade = echo().on_close(
        move |_, data: Option<UserData>| {
            let tx = tx.clone();
            async move {
                let room = data.and_then(|d| d.downcast_ref::<String>().cloned());
                let _ = tx.send(room);
            }
        },
        Some(data),
    );

    let (server, client) = pair(upgrade, ClientRequest::new("ws://localhost/").unwrap()).await;
    client.close().await.unwrap();
    assert_eq!(server.wait_closed(WAIT).await, ConnectionStatus::Closed);

    let room = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(room, Some(Some("room-7".to_string())));
}

#[tokio::test]
async fn test_client_sees_rejection_status() {
    let (mut server_io, client_io) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            server_io.read_buf(&mut buf).await.unwrap();
        }
        server_io
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 14\r\n\r\nPage not found")
            .await
            .unwrap();
        server_io
    });

    let err = connect_with_stream(client_io, ClientRequest::new("ws://localhost/missing").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, WsError::Rejected { status: 404 }));
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_client_rejects_bad_accept_key() {
    let (mut server_io, client_io) = tokio::io::duplex(1 << 16);
    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            server_io.read_buf(&mut buf).await.unwrap();
        }
        server_io
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                  Connection: Upgrade\r\nSec-WebSocket-Accept: bogus\r\n\r\n",
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let err = connect_with_stream(client_io, ClientRequest::new("ws://localhost/").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, WsError::HandshakeFailed(_)));
}
