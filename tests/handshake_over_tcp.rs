use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use authgate::codec::HEARTBEAT_PROBE;
use authgate::{
    ConnectionEvent, HandshakeSettings, ShimConnector, StageChain, Target, channel_endpoint,
};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn settings() -> HandshakeSettings {
    let mut settings = HandshakeSettings::new("it-cluster");
    settings.api_key = "it-key".to_string();
    // matches 127.0.0.1 without any name resolution
    settings.host_suffixes = vec![".0.0.1".to_string()];
    settings.ssl_ports = vec![];
    settings.keepalive_interval = Duration::ZERO;
    settings
}

fn response(revision: i32, status_code: i32, description: &str) -> Vec<u8> {
    let mut frame = Vec::new();
    let length = 4 + 4 + 4 + description.len() as i32;
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&revision.to_be_bytes());
    frame.extend_from_slice(&status_code.to_be_bytes());
    frame.extend_from_slice(&(description.len() as i32).to_be_bytes());
    frame.extend_from_slice(description.as_bytes());
    frame
}

/// Returns (cluster name, api key) from an auth frame body.
fn parse_auth_body(body: &[u8]) -> (String, String) {
    let read_i32 = |at: usize| i32::from_be_bytes(body[at..at + 4].try_into().unwrap());
    assert_eq!(read_i32(0), 4);
    assert_eq!(read_i32(4), 1);
    assert_eq!(read_i32(8), 8);

    let name_len = read_i32(20) as usize;
    let name = String::from_utf8(body[24..24 + name_len].to_vec()).unwrap();
    let key_at = 24 + name_len;
    let key_len = read_i32(key_at) as usize;
    let key = String::from_utf8(body[key_at + 4..key_at + 4 + key_len].to_vec()).unwrap();
    assert_eq!(body.len(), key_at + 4 + key_len);
    (name, key)
}

async fn read_auth_frame(socket: &mut TcpStream) -> (String, String) {
    let mut len = [0u8; 4];
    socket.read_exact(&mut len).await.unwrap();
    let mut body = vec![0u8; i32::from_be_bytes(len) as usize];
    socket.read_exact(&mut body).await.unwrap();
    parse_auth_body(&body)
}

async fn collect_data(events: &mut UnboundedReceiver<ConnectionEvent>, len: usize) -> Vec<u8> {
    let mut data = Vec::new();
    while data.len() < len {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(ConnectionEvent::Data(d)) => data.extend_from_slice(&d),
            Some(ConnectionEvent::Connected(_)) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    data
}

async fn local_listener() -> (TcpListener, Target) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Target::new("127.0.0.1", port))
}

#[tokio::test]
async fn test_authenticated_session() {
    let (listener, target) = local_listener().await;

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (name, key) = read_auth_frame(&mut socket).await;
        assert_eq!(name, "it-cluster");
        assert_eq!(key, "it-key");

        let mut reply = response(1, 200, "OK");
        reply.extend_from_slice(b"hello");
        socket.write_all(&reply).await.unwrap();

        let mut ping = [0u8; 4];
        socket.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
        socket.write_all(b"pong").await.unwrap();
    });

    let connector = ShimConnector::new(settings());
    let (endpoint, mut events) = channel_endpoint();
    let connection = connector
        .connect(target.clone(), StageChain::new().with("app", endpoint))
        .await
        .unwrap();
    connection.write(Bytes::from_static(b"ping")).unwrap();

    match timeout(WAIT, events.recv()).await.unwrap() {
        Some(ConnectionEvent::Connected(t)) => assert_eq!(t, target),
        other => panic!("expected connected event, got {other:?}"),
    }
    assert_eq!(collect_data(&mut events, 9).await, b"hellopong");
    assert_eq!(connection.stage_names(), vec!["app"]);

    timeout(WAIT, peer).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_session_never_reaches_caller() {
    let (listener, target) = local_listener().await;

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_auth_frame(&mut socket).await;
        socket
            .write_all(&response(1, 401, "Unauthorized"))
            .await
            .unwrap();
        // the client hangs up without sending the held write
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let connector = ShimConnector::new(settings());
    let (endpoint, mut events) = channel_endpoint();
    let connection = connector
        .connect(target, StageChain::new().with("app", endpoint))
        .await
        .unwrap();
    connection.write(Bytes::from_static(b"secret")).unwrap();

    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
    assert!(!connection.is_open());
    assert!(timeout(WAIT, peer).await.unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn test_passthrough_sends_no_frame() {
    let (listener, target) = local_listener().await;

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut data = [0u8; 5];
        socket.read_exact(&mut data).await.unwrap();
        assert_eq!(&data, b"plain");
        socket.write_all(b"reply").await.unwrap();
    });

    let mut settings = settings();
    settings.host_suffixes = vec![".foundcluster.com".to_string()];
    let connector = ShimConnector::new(settings);
    let (endpoint, mut events) = channel_endpoint();
    let connection = connector
        .connect(target, StageChain::new().with("app", endpoint))
        .await
        .unwrap();
    connection.write(Bytes::from_static(b"plain")).unwrap();

    assert_eq!(collect_data(&mut events, 5).await, b"reply");
    timeout(WAIT, peer).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_heartbeat_on_idle_session() {
    let (listener, target) = local_listener().await;

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_auth_frame(&mut socket).await;
        socket.write_all(&response(1, 200, "OK")).await.unwrap();

        let mut first = [0u8; 1];
        socket.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"x");

        let mut probe = [0u8; 6];
        socket.read_exact(&mut probe).await.unwrap();
        probe
    });

    let mut settings = settings();
    settings.keepalive_interval = Duration::from_millis(200);
    settings.heartbeat_check_interval = Duration::from_millis(50);
    let connector = ShimConnector::new(settings);
    let (endpoint, _events) = channel_endpoint();
    let connection = connector
        .connect(target, StageChain::new().with("app", endpoint))
        .await
        .unwrap();
    connection.write(Bytes::from_static(b"x")).unwrap();

    let probe = timeout(WAIT, peer).await.unwrap().unwrap();
    assert_eq!(probe, HEARTBEAT_PROBE);
    connection.close().unwrap();
}

#[tokio::test]
async fn test_handshake_timeout_closes_connection() {
    let (listener, target) = local_listener().await;

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_auth_frame(&mut socket).await;
        // never answer
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let mut settings = settings();
    settings.handshake_timeout = Some(Duration::from_millis(200));
    let connector = ShimConnector::new(settings);
    let (endpoint, mut events) = channel_endpoint();
    let connection = connector
        .connect(target, StageChain::new().with("app", endpoint))
        .await
        .unwrap();
    connection.write(Bytes::from_static(b"x")).unwrap();

    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
    assert!(!connection.is_open());
    timeout(WAIT, peer).await.unwrap().unwrap();
}

fn tls_server_config(host: &str) -> Arc<rustls::ServerConfig> {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, host);
    let cert = params.self_signed(&key_pair).unwrap();

    let cert_der = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
    );

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)
    .unwrap();
    Arc::new(config)
}

#[tokio::test]
async fn test_tls_session_with_self_signed_certificate() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server_config = tls_server_config("127.0.0.1");

    let peer = std::thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        let connection = rustls::ServerConnection::new(server_config).unwrap();
        let mut stream = rustls::StreamOwned::new(connection, socket);

        let mut len = [0u8; 4];
        stream.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; i32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).unwrap();
        let (name, _) = parse_auth_body(&body);

        let mut reply = response(1, 200, "OK");
        reply.extend_from_slice(b"secure");
        stream.write_all(&reply).unwrap();
        stream.flush().unwrap();

        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).unwrap();
        stream.write_all(b"pong").unwrap();
        stream.flush().unwrap();
        (name, ping)
    });

    let mut settings = settings();
    settings.ssl_ports = vec![port];
    settings.allow_self_signed = true;
    let connector = ShimConnector::new(settings);
    let (endpoint, mut events) = channel_endpoint();
    let connection = connector
        .connect(
            Target::new("127.0.0.1", port),
            StageChain::new().with("app", endpoint),
        )
        .await
        .unwrap();
    connection.write(Bytes::from_static(b"ping")).unwrap();

    assert_eq!(collect_data(&mut events, 10).await, b"securepong");
    assert_eq!(connection.stage_names(), vec!["tls", "app"]);

    let (name, ping) = tokio::task::spawn_blocking(move || peer.join().unwrap())
        .await
        .unwrap();
    assert_eq!(name, "it-cluster");
    assert_eq!(&ping, b"ping");
    connection.close().unwrap();
}

#[tokio::test]
async fn test_tls_name_mismatch_closes_connection() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server_config = tls_server_config("someone-else.example.com");

    let peer = std::thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        let connection = rustls::ServerConnection::new(server_config).unwrap();
        let mut stream = rustls::StreamOwned::new(connection, socket);
        let mut buf = [0u8; 1];
        // fails once the client aborts the TLS handshake
        stream.read(&mut buf).is_err() || buf == [0]
    });

    let mut settings = settings();
    settings.ssl_ports = vec![port];
    settings.allow_self_signed = true;
    let connector = ShimConnector::new(settings);
    let (endpoint, mut events) = channel_endpoint();
    let connection = connector
        .connect(
            Target::new("127.0.0.1", port),
            StageChain::new().with("app", endpoint),
        )
        .await
        .unwrap();
    connection.write(Bytes::from_static(b"ping")).unwrap();

    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
    assert!(!connection.is_open());
    let _ = tokio::task::spawn_blocking(move || peer.join()).await;
}
