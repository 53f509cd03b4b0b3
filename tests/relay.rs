//! Relay tests over real loopback sockets

mod common;

use idlegate::config::ProxyConfig;
use idlegate::lifecycle::TrafficSignal;
use idlegate::relay::UdpRelay;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

fn proxy_config(target: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        port: 0,
        bind: "127.0.0.1".to_string(),
        target_address: Some(target.to_string()),
        connection_timeout_ms: 1000,
        ..Default::default()
    }
}

async fn start_relay(
    target: SocketAddr,
    signal: Option<TrafficSignal>,
) -> (Arc<UdpRelay>, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let relay = UdpRelay::bind(&proxy_config(target), signal).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = Arc::clone(&relay);
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });
    (relay, shutdown_tx, handle)
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv(socket: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 2048];
    match timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
        _ => None,
    }
}

#[tokio::test]
async fn test_datagram_round_trip() {
    let echo = common::spawn_echo_server().await;
    let (relay, shutdown_tx, handle) = start_relay(echo, None).await;

    let c = client().await;
    c.send_to(b"ping\x00\xff", relay.local_addr()).await.unwrap();

    let (payload, from) = recv(&c).await.expect("reply from relay");
    assert_eq!(payload, b"ping\x00\xff");
    // Replies come from the proxy port, never from the backend directly
    assert_eq!(from, relay.local_addr());
    assert_eq!(relay.connection_count(), 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    assert_eq!(relay.connection_count(), 0);
}

#[tokio::test]
async fn test_each_client_is_its_own_connection() {
    let echo = common::spawn_echo_server().await;
    let (relay, _shutdown_tx, _handle) = start_relay(echo, None).await;

    let clients = [client().await, client().await, client().await];
    for (i, c) in clients.iter().enumerate() {
        c.send_to(format!("client-{}", i).as_bytes(), relay.local_addr())
            .await
            .unwrap();
    }
    for (i, c) in clients.iter().enumerate() {
        let (payload, _) = recv(c).await.expect("reply");
        assert_eq!(payload, format!("client-{}", i).as_bytes());
    }
    assert_eq!(relay.connection_count(), 3);

    // Further packets from a known client reuse its connection
    clients[0].send_to(b"again", relay.local_addr()).await.unwrap();
    assert_eq!(recv(&clients[0]).await.unwrap().0, b"again");
    assert_eq!(relay.connection_count(), 3);

    let mut seen = relay.clients();
    seen.sort();
    let mut expected: Vec<SocketAddr> = clients.iter().map(|c| c.local_addr().unwrap()).collect();
    expected.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_new_client_fires_traffic_signal_once() {
    let echo = common::spawn_echo_server().await;
    let signal = TrafficSignal::new();
    let (relay, _shutdown_tx, _handle) = start_relay(echo, Some(signal.clone())).await;

    let c = client().await;
    c.send_to(b"one", relay.local_addr()).await.unwrap();
    recv(&c).await.unwrap();
    assert!(timeout(Duration::from_secs(1), signal.notified()).await.is_ok());

    c.send_to(b"two", relay.local_addr()).await.unwrap();
    recv(&c).await.unwrap();
    assert!(timeout(Duration::from_millis(200), signal.notified())
        .await
        .is_err());
}

#[tokio::test]
async fn test_pruned_connection_stops_relaying() {
    // Hand-driven backend so replies can be aimed at a stale upstream port
    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (relay, _shutdown_tx, _handle) = start_relay(backend.local_addr().unwrap(), None).await;

    let c = client().await;
    c.send_to(b"hello", relay.local_addr()).await.unwrap();

    let mut buf = [0u8; 64];
    let (len, upstream) = timeout(Duration::from_secs(2), backend.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"hello");

    backend.send_to(b"reply", upstream).await.unwrap();
    assert_eq!(recv(&c).await.unwrap().0, b"reply");

    // Not yet idle for longer than the timeout
    assert_eq!(relay.prune_idle(), 0);

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(relay.prune_idle(), 1);
    assert_eq!(relay.connection_count(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    backend.send_to(b"stale", upstream).await.unwrap();
    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(300), c.recv_from(&mut buf))
        .await
        .is_err());

    // The same client comes back as a new connection on a new upstream socket
    c.send_to(b"back", relay.local_addr()).await.unwrap();
    let (_, new_upstream) = timeout(Duration::from_secs(2), backend.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(new_upstream, upstream);
    assert_eq!(relay.connection_count(), 1);
}

#[tokio::test]
async fn test_backend_replies_keep_connection_alive() {
    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (relay, _shutdown_tx, _handle) = start_relay(backend.local_addr().unwrap(), None).await;

    let c = client().await;
    c.send_to(b"hello", relay.local_addr()).await.unwrap();
    let mut buf = [0u8; 64];
    let (_, upstream) = timeout(Duration::from_secs(2), backend.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // Only the backend talks; that still counts as activity
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        backend.send_to(b"tick", upstream).await.unwrap();
        recv(&c).await.unwrap();
        assert_eq!(relay.prune_idle(), 0);
    }
    assert_eq!(relay.connection_count(), 1);
}
