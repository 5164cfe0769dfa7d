//! Integration tests for WebSocket transport

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::routing::get;
use bytes::Bytes;
use proven_transport::protocol::{Decoder, ServerInfo, ServerOp};
use proven_transport::{Connection, Endpoint, Transport, TransportError};
use proven_transport_ws::{WebSocketTransport, probe};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::info;

fn server_info() -> ServerInfo {
    ServerInfo {
        server_id: "test-server".to_string(),
        server_name: "loopback".to_string(),
        version: "2.10.0".to_string(),
        max_payload: 1024 * 1024,
        ..ServerInfo::default()
    }
}

/// Greets with INFO, then echoes every binary frame back.
async fn serve_socket(mut socket: WebSocket, info: ServerInfo) {
    let Ok(greeting) = ServerOp::Info(Box::new(info)).encode() else {
        return;
    };
    if socket.send(Message::Binary(greeting)).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(data) => {
                info!("Server received: {} bytes", data.len());
                if socket.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn start_server() -> SocketAddr {
    let info = server_info();
    let app = Router::new()
        .route(
            "/",
            get(move |ws: WebSocketUpgrade| {
                let info = info.clone();
                async move { ws.on_upgrade(move |socket| serve_socket(socket, info)) }
            }),
        )
        .route("/private", get(|| async { StatusCode::UNAUTHORIZED }));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address");
    info!("Test server listening on {}", addr);

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    addr
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    listener.local_addr().expect("No local address").port()
}

async fn read_greeting(connection: &dyn Connection) -> ServerInfo {
    let mut decoder = Decoder::new();
    loop {
        let chunk = timeout(Duration::from_secs(1), connection.recv())
            .await
            .expect("Receive timeout")
            .expect("Failed to receive");
        decoder.extend(&chunk);
        match decoder.next_server_op().expect("Invalid server op") {
            Some(ServerOp::Info(info)) => return *info,
            Some(other) => panic!("unexpected op {other:?}"),
            None => {}
        }
    }
}

#[tokio::test]
async fn test_websocket_greeting_and_echo() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = start_server().await;
    let endpoint = Endpoint::parse(&format!("ws://{addr}/")).unwrap();

    let transport = WebSocketTransport::new();
    let connection = timeout(Duration::from_secs(5), transport.connect(&endpoint))
        .await
        .expect("Connect timeout")
        .expect("Failed to connect");

    let info = read_greeting(connection.as_ref()).await;
    assert_eq!(info.server_id, "test-server");

    let test_messages = vec![
        Bytes::from("PING\r\n"),
        Bytes::from("PUB a.b 5\r\nhello\r\n"),
        Bytes::from("Final message"),
    ];

    for msg in test_messages {
        connection.send(msg.clone()).await.expect("Failed to send");

        let response = timeout(Duration::from_secs(1), connection.recv())
            .await
            .expect("Receive timeout")
            .expect("Failed to receive");

        assert_eq!(msg, response);
    }

    connection.close().await.expect("Failed to close");
    // Closing twice is a no-op
    connection.close().await.expect("Second close failed");

    assert!(matches!(
        connection.send(Bytes::from("late")).await,
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_send_while_receiver_waits() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = start_server().await;
    let endpoint = Endpoint::parse(&format!("ws://{addr}/")).unwrap();

    let connection: Arc<dyn Connection> = Arc::from(
        WebSocketTransport::new()
            .connect(&endpoint)
            .await
            .expect("Failed to connect"),
    );
    read_greeting(connection.as_ref()).await;

    let reader = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.recv().await })
    };

    // The reader holds the read half; sending must still go through.
    tokio::time::sleep(Duration::from_millis(50)).await;
    timeout(
        Duration::from_secs(1),
        connection.send(Bytes::from("concurrent")),
    )
    .await
    .expect("Send blocked by pending receive")
    .expect("Failed to send");

    let echoed = timeout(Duration::from_secs(1), reader)
        .await
        .expect("Receive timeout")
        .expect("Reader panicked")
        .expect("Failed to receive");
    assert_eq!(echoed, Bytes::from("concurrent"));
}

#[tokio::test]
async fn test_refused_connection() {
    let _ = tracing_subscriber::fmt::try_init();

    let port = unused_port().await;
    let endpoint = Endpoint::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();

    let result = timeout(
        Duration::from_secs(5),
        WebSocketTransport::new().connect(&endpoint),
    )
    .await
    .expect("Connect timeout");

    assert!(matches!(result, Err(TransportError::Refused(_))));
}

#[tokio::test]
async fn test_unauthorized_upgrade() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = start_server().await;
    let endpoint = Endpoint::parse(&format!("ws://{addr}/private")).unwrap();

    let result = timeout(
        Duration::from_secs(5),
        WebSocketTransport::new().connect(&endpoint),
    )
    .await
    .expect("Connect timeout");

    assert!(matches!(result, Err(TransportError::Unauthorized(_))));
}

#[tokio::test]
async fn test_probe_reports_greeting() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = start_server().await;
    let endpoint = Endpoint::parse(&format!("ws://{addr}/")).unwrap();

    let report = probe(&endpoint, Duration::from_secs(2))
        .await
        .expect("Probe failed");

    assert!(report.is_broker());
    assert!(!report.secure);
    assert_eq!(report.server_info.unwrap().server_name, "loopback");
}

#[tokio::test]
async fn test_probe_refused() {
    let _ = tracing_subscriber::fmt::try_init();

    let port = unused_port().await;
    let endpoint = Endpoint::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();

    let result = probe(&endpoint, Duration::from_secs(2)).await;
    assert!(matches!(result, Err(TransportError::Refused(_))));
}
