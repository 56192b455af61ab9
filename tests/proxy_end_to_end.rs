//! End-to-end tests: real client sockets through a running proxy to a
//! scripted broker on loopback

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mqtt_cluster_proxy::config::ProxyConfig;
use mqtt_cluster_proxy::core::codec::MqttCodec;
use mqtt_cluster_proxy::core::message::{Body, Connect, ConnectReturnCode, Message, QoS};
use mqtt_cluster_proxy::service::ProxyServer;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

type Conn = Framed<TcpStream, MqttCodec>;

struct Proxy {
    client_addr: std::net::SocketAddr,
    broker: TcpListener,
    shutdown: mpsc::Sender<()>,
    server: Arc<ProxyServer>,
    task: tokio::task::JoinHandle<mqtt_cluster_proxy::Result<()>>,
}

async fn start_proxy() -> Proxy {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ProxyConfig::default_with_overrides(|c| {
        c.broker.address = broker.local_addr().unwrap().to_string();
        c.server.handshake_timeout = Duration::from_millis(500);
        c.server.shutdown_timeout = Duration::from_secs(2);
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = listener.local_addr().unwrap();
    let server = Arc::new(ProxyServer::new(config));
    let (shutdown, shutdown_rx) = mpsc::channel(1);
    let task = tokio::spawn(Arc::clone(&server).serve(listener, shutdown_rx));

    Proxy {
        client_addr,
        broker,
        shutdown,
        server,
        task,
    }
}

async fn recv(conn: &mut Conn) -> Message {
    timeout(WAIT, conn.next())
        .await
        .expect("message within timeout")
        .expect("connection open")
        .expect("valid frame")
}

/// True once the peer has closed the connection
async fn closed(conn: &mut Conn) -> bool {
    matches!(timeout(WAIT, conn.next()).await, Ok(None) | Ok(Some(Err(_))))
}

async fn client(proxy: &Proxy, connect: Connect) -> Conn {
    let stream = TcpStream::connect(proxy.client_addr).await.unwrap();
    let mut conn = Framed::new(stream, MqttCodec::new());
    conn.send(Message::connect(connect)).await.unwrap();
    conn
}

/// Accept the session's broker connection and answer its CONNECT
async fn accept_broker(proxy: &Proxy, code: ConnectReturnCode) -> (Conn, Connect) {
    let (stream, _) = timeout(WAIT, proxy.broker.accept()).await.unwrap().unwrap();
    let mut broker = Framed::new(stream, MqttCodec::new());
    let connect = match recv(&mut broker).await.body {
        Body::Connect(connect) => connect,
        other => panic!("broker expected CONNECT, got {other:?}"),
    };
    broker.send(Message::connack(code)).await.unwrap();
    (broker, connect)
}

fn return_code(message: &Message) -> ConnectReturnCode {
    match &message.body {
        Body::ConnAck(ack) => ack.return_code,
        other => panic!("expected CONNACK, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_client_session() {
    let proxy = start_proxy().await;

    let mut c1 = client(&proxy, Connect::new("device", false, 0)).await;
    let (mut broker, upstream) = accept_broker(&proxy, ConnectReturnCode::Accepted).await;
    assert_eq!(upstream.client_id, "device");
    assert!(!upstream.clean_session);
    assert_eq!(return_code(&recv(&mut c1).await), ConnectReturnCode::Accepted);

    // Client identifiers are replaced by broker identifiers and restored on the ack
    c1.send(Message::publish("t", &b"1"[..], QoS::AtLeastOnce, 123))
        .await
        .unwrap();
    let forwarded = recv(&mut broker).await;
    assert_eq!(forwarded.message_id(), Some(1));
    broker.send(Message::puback(1)).await.unwrap();
    assert_eq!(recv(&mut c1).await, Message::puback(123));

    // QoS 0 passes straight through in both directions
    c1.send(Message::publish("t", &b"q0"[..], QoS::AtMostOnce, 0))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut broker).await,
        Message::publish("t", &b"q0"[..], QoS::AtMostOnce, 0)
    );
    broker
        .send(Message::publish("down", &b"hello"[..], QoS::AtMostOnce, 0))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut c1).await,
        Message::publish("down", &b"hello"[..], QoS::AtMostOnce, 0)
    );

    // PINGREQ is answered by the proxy, not the broker
    c1.send(Message::pingreq()).await.unwrap();
    assert_eq!(recv(&mut c1).await, Message::pingresp());
}

#[tokio::test]
async fn test_two_clients_share_one_broker_connection() {
    let proxy = start_proxy().await;

    let mut c1 = client(&proxy, Connect::new("shared", false, 0)).await;
    let (mut broker, _) = accept_broker(&proxy, ConnectReturnCode::Accepted).await;
    assert_eq!(return_code(&recv(&mut c1).await), ConnectReturnCode::Accepted);

    let mut c2 = client(&proxy, Connect::new("shared", false, 0)).await;
    assert_eq!(return_code(&recv(&mut c2).await), ConnectReturnCode::Accepted);

    // Same client identifier on both connections maps to distinct broker identifiers
    c1.send(Message::publish("a", &b"1"[..], QoS::AtLeastOnce, 7))
        .await
        .unwrap();
    let first = recv(&mut broker).await.message_id().unwrap();
    c2.send(Message::publish("b", &b"2"[..], QoS::AtLeastOnce, 7))
        .await
        .unwrap();
    let second = recv(&mut broker).await.message_id().unwrap();
    assert_ne!(first, second);

    broker.send(Message::puback(second)).await.unwrap();
    assert_eq!(recv(&mut c2).await, Message::puback(7));
    broker.send(Message::puback(first)).await.unwrap();
    assert_eq!(recv(&mut c1).await, Message::puback(7));

    // No second broker connection was opened
    assert!(timeout(Duration::from_millis(200), proxy.broker.accept())
        .await
        .is_err());
    assert_eq!(proxy.server.registry().len(), 1);
}

#[tokio::test]
async fn test_joining_client_with_other_credentials_is_rejected() {
    let proxy = start_proxy().await;

    let mut c1 = client(
        &proxy,
        Connect::new("secure", false, 0).with_credentials("user", Some("pw")),
    )
    .await;
    let (_broker, upstream) = accept_broker(&proxy, ConnectReturnCode::Accepted).await;
    assert_eq!(upstream.username.as_deref(), Some("user"));
    assert_eq!(return_code(&recv(&mut c1).await), ConnectReturnCode::Accepted);

    let mut c2 = client(
        &proxy,
        Connect::new("secure", false, 0).with_credentials("user", Some("other")),
    )
    .await;
    assert_eq!(
        return_code(&recv(&mut c2).await),
        ConnectReturnCode::BadCredentials
    );
    assert!(closed(&mut c2).await);
}

#[tokio::test]
async fn test_clean_session_is_refused_at_handshake() {
    let proxy = start_proxy().await;

    let mut conn = client(&proxy, Connect::new("dev", true, 0)).await;
    assert_eq!(return_code(&recv(&mut conn).await), ConnectReturnCode::OTHER);
    assert!(closed(&mut conn).await);
    assert!(proxy.server.registry().is_empty());
}

#[tokio::test]
async fn test_empty_client_id_is_refused_at_handshake() {
    let proxy = start_proxy().await;

    let mut conn = client(&proxy, Connect::new("", false, 0)).await;
    assert_eq!(
        return_code(&recv(&mut conn).await),
        ConnectReturnCode::IdentifierRejected
    );
}

#[tokio::test]
async fn test_non_connect_first_message_drops_connection() {
    let proxy = start_proxy().await;

    let stream = TcpStream::connect(proxy.client_addr).await.unwrap();
    let mut conn = Framed::new(stream, MqttCodec::new());
    conn.send(Message::pingreq()).await.unwrap();
    assert!(closed(&mut conn).await);
}

#[tokio::test]
async fn test_broker_rejection_reaches_client() {
    let proxy = start_proxy().await;

    let mut c1 = client(&proxy, Connect::new("denied", false, 0)).await;
    let (_broker, _) = accept_broker(&proxy, ConnectReturnCode::NotAuthorized).await;
    assert_eq!(
        return_code(&recv(&mut c1).await),
        ConnectReturnCode::NotAuthorized
    );
    assert!(closed(&mut c1).await);
}

#[tokio::test]
async fn test_broker_loss_closes_clients() {
    let proxy = start_proxy().await;

    let mut c1 = client(&proxy, Connect::new("fragile", false, 0)).await;
    let (broker, _) = accept_broker(&proxy, ConnectReturnCode::Accepted).await;
    assert_eq!(return_code(&recv(&mut c1).await), ConnectReturnCode::Accepted);

    drop(broker);
    assert!(closed(&mut c1).await);
}

#[tokio::test]
async fn test_last_client_leaving_disconnects_broker() {
    let proxy = start_proxy().await;

    let mut c1 = client(&proxy, Connect::new("leaver", false, 0)).await;
    let (mut broker, _) = accept_broker(&proxy, ConnectReturnCode::Accepted).await;
    assert_eq!(return_code(&recv(&mut c1).await), ConnectReturnCode::Accepted);

    c1.send(Message::disconnect()).await.unwrap();
    assert_eq!(recv(&mut broker).await, Message::disconnect());
    assert!(closed(&mut broker).await);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let proxy = start_proxy().await;

    let mut c1 = client(&proxy, Connect::new("shutdown", false, 0)).await;
    let (mut broker, _) = accept_broker(&proxy, ConnectReturnCode::Accepted).await;
    assert_eq!(return_code(&recv(&mut c1).await), ConnectReturnCode::Accepted);

    proxy.shutdown.send(()).await.unwrap();
    let result = timeout(WAIT, proxy.task).await.expect("server stops").unwrap();
    assert!(result.is_ok());

    assert!(closed(&mut c1).await);
    assert!(closed(&mut broker).await);
}
