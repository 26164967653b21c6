//! Integration tests for SniTun
//!
//! Covers the full edge-to-backend flow:
//! - Tunnel handshake and peer registration
//! - SNI dispatch into the owning peer's channels
//! - Flow control under a slow consumer
//! - Rejection paths: unknown SNI, expired tokens
//! - Hostname takeover by a newer session

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fernet::Fernet;
use snitun::client::ClientWorker;
use snitun::config::ClientConfig;
use snitun::crypto::{random_array32, random_bytes, unix_now, TokenIssuer, TokenPayload};
use snitun::multiplexer::Multiplexer;
use snitun::server::{PeerListener, PeerManager, SniProxy};
use snitun::sni::testing::build_client_hello;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct TestServer {
    manager: Arc<PeerManager>,
    fernet_key: String,
    tunnel_addr: SocketAddr,
    sni_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind a full server (tunnel + SNI listeners) on loopback
async fn start_server() -> TestServer {
    let fernet_key = Fernet::generate_key();
    let verifier =
        Arc::new(snitun::crypto::TokenVerifier::new(&[fernet_key.clone()]).unwrap());
    let manager = Arc::new(PeerManager::new());

    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sni_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();
    let sni_addr = sni_listener.local_addr().unwrap();

    let peer_listener = PeerListener::new(Arc::clone(&manager), verifier, None);
    let sni_proxy = SniProxy::new(Arc::clone(&manager));

    let tasks = vec![
        tokio::spawn(async move { peer_listener.run(tunnel_listener).await }),
        tokio::spawn(async move { sni_proxy.run(sni_listener).await }),
    ];

    TestServer {
        manager,
        fernet_key,
        tunnel_addr,
        sni_addr,
        tasks,
    }
}

/// Credentials for one client worker
fn client_config(server: &TestServer, backend: SocketAddr, hostname: &str) -> ClientConfig {
    let mut aes_iv = [0u8; 16];
    random_bytes(&mut aes_iv);
    ClientConfig {
        server: server.tunnel_addr.to_string(),
        local_endpoint: backend.to_string(),
        fernet_key: server.fernet_key.clone(),
        identity: STANDARD.encode(random_array32()),
        hostnames: vec![hostname.to_string()],
        aes_key: STANDARD.encode(random_array32()),
        aes_iv: STANDARD.encode(aes_iv),
        keepalive_secs: 5,
        token_ttl_secs: 300,
    }
}

/// Poll until the registry holds `count` peers
async fn wait_for_peers(manager: &PeerManager, count: usize) {
    for _ in 0..100 {
        if manager.connections() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "Expected {} registered peers, have {}",
        count,
        manager.connections()
    );
}

/// End-to-end: outside TLS bytes reach the backend verbatim and the
/// backend's reply travels back out
#[tokio::test]
async fn test_happy_path() {
    let server = start_server().await;

    // Local backend: captures what it received, answers, closes
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();

    let request = b"GET / HTTP/1.0\r\n\r\n";
    let hello = build_client_hello("example.com");
    let expected_len = hello.len() + request.len();

    let (received_tx, mut received_rx) = mpsc::channel::<Vec<u8>>(1);
    tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        let mut received = vec![0u8; expected_len];
        stream.read_exact(&mut received).await.unwrap();
        received_tx.send(received).await.unwrap();
        stream
            .write_all(b"HTTP/1.0 200 OK\r\n\r\nhi")
            .await
            .unwrap();
    });

    // Client worker holding example.com
    let config = client_config(&server, backend_addr, "example.com");
    let worker = ClientWorker::from_config(&config).unwrap();
    let session = tokio::spawn(async move { worker.run_session().await });
    wait_for_peers(&server.manager, 1).await;

    // Outside connection with SNI example.com
    let mut outside = TcpStream::connect(server.sni_addr).await.unwrap();
    outside.write_all(&hello).await.unwrap();
    outside.write_all(request).await.unwrap();

    let backend_saw = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
        .await
        .expect("backend never reached")
        .unwrap();
    assert_eq!(&backend_saw[..hello.len()], &hello[..]);
    assert_eq!(&backend_saw[hello.len()..], request);

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), outside.read_to_end(&mut reply))
        .await
        .expect("no reply from tunnel")
        .unwrap();
    assert_eq!(&reply[..], b"HTTP/1.0 200 OK\r\n\r\nhi");

    session.abort();
}

/// Outside connection for a hostname nobody owns is dropped
#[tokio::test]
async fn test_unknown_sni_dropped() {
    let server = start_server().await;

    let mut outside = TcpStream::connect(server.sni_addr).await.unwrap();
    outside
        .write_all(&build_client_hello("nope.example.com"))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(3), outside.read(&mut buf))
        .await
        .expect("socket should close promptly")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(server.manager.connections(), 0);
}

/// A token whose lifetime already ran out never registers a peer
#[tokio::test]
async fn test_expired_token_rejected() {
    let server = start_server().await;
    let issuer = TokenIssuer::new(&server.fernet_key).unwrap();

    let mut stream = TcpStream::connect(server.tunnel_addr).await.unwrap();
    stream.write_all(&random_array32()).await.unwrap();

    let mut challenge = [0u8; 32];
    stream.read_exact(&mut challenge).await.unwrap();

    let mut aes_iv = [0u8; 16];
    random_bytes(&mut aes_iv);
    let token = issuer.mint(&TokenPayload {
        challenge,
        identity: random_array32(),
        valid_until: unix_now() - 1,
        hostnames: vec!["example.com".into()],
        aes_key: random_array32(),
        aes_iv,
    });
    stream
        .write_all(&(token.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(token.as_bytes()).await.unwrap();

    // No reply; the socket just closes
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("socket should close promptly")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(server.manager.connections(), 0);
    assert!(server.manager.get_by_hostname("example.com").is_none());
}

/// A newer session takes a hostname over and the old session is closed
#[tokio::test]
async fn test_duplicate_hostname_takeover() {
    let server = start_server().await;
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let config_a = client_config(&server, backend_addr, "example.com");
    let worker_a = ClientWorker::from_config(&config_a).unwrap();
    let session_a = tokio::spawn(async move { worker_a.run_session().await });
    wait_for_peers(&server.manager, 1).await;

    let config_b = client_config(&server, backend_addr, "example.com");
    let identity_b = STANDARD.decode(&config_b.identity).unwrap();
    let worker_b = ClientWorker::from_config(&config_b).unwrap();
    let session_b = tokio::spawn(async move { worker_b.run_session().await });

    // The hostname must move to B
    let mut taken_over = false;
    for _ in 0..100 {
        if let Some(owner) = server.manager.get_by_hostname("example.com") {
            if owner.identity()[..] == identity_b[..] {
                taken_over = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(taken_over, "hostname never moved to the new session");

    // A's tunnel was torn down; its session ends on its own
    tokio::time::timeout(Duration::from_secs(5), session_a)
        .await
        .expect("evicted session should end")
        .unwrap()
        .unwrap();

    session_b.abort();
}

/// A fast producer against a slow consumer: everything arrives, in order,
/// which requires PAUSE/RESUME to work (a lost RESUME would wedge the test)
#[tokio::test]
async fn test_flow_control_slow_consumer() {
    const TOTAL: usize = 5 * 1024 * 1024;

    let key = random_array32();
    let mut iv = [0u8; 16];
    random_bytes(&mut iv);

    let (near, far) = tokio::io::duplex(64 * 1024);
    let producer_mux = Multiplexer::start(near, &key, &iv).unwrap();
    let consumer_mux = Multiplexer::start(far, &key, &iv).unwrap();

    let mut outgoing = producer_mux.create_channel("example.com").await.unwrap();
    let mut incoming = consumer_mux.wait_for_channel().await.unwrap();

    let producer = tokio::spawn(async move {
        let block: Vec<u8> = (0..65536).map(|i| (i % 199) as u8).collect();
        let mut sent = 0;
        while sent < TOTAL {
            let n = block.len().min(TOTAL - sent);
            outgoing.write(&block[..n]).await.unwrap();
            sent += n;
        }
        outgoing.close().await;
    });

    // Let the incoming queue fill past the high-water mark first
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut received = Vec::with_capacity(TOTAL);
    let mut chunks = 0usize;
    while let Some(data) = incoming.read().await {
        received.extend_from_slice(&data);
        chunks += 1;
        if chunks % 256 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    producer.await.unwrap();

    assert_eq!(received.len(), TOTAL);
    let expected: Vec<u8> = (0..TOTAL).map(|i| ((i % 65536) % 199) as u8).collect();
    assert_eq!(received, expected);
}

/// Ping keepalive round-trips across a live session
#[tokio::test]
async fn test_session_ping() {
    let server = start_server().await;
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let config = client_config(&server, backend.local_addr().unwrap(), "ping.example.com");
    let worker = ClientWorker::from_config(&config).unwrap();
    let session = tokio::spawn(async move { worker.run_session().await });
    wait_for_peers(&server.manager, 1).await;

    let peer = server.manager.get_by_hostname("ping.example.com").unwrap();
    peer.ping().await.expect("peer should answer pings");

    session.abort();
}
