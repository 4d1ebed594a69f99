//! Drives a real [`ClientRole`] over loopback TCP/UDP against a hand-rolled peer
//! that plays the server side of the wire protocol directly through
//! [`CryptoEngine`]/[`ControlMessage`], mirroring `transport_client.py` being
//! exercised against a bare socket server in the historical test suite.

use std::net::Ipv4Addr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use echowarp::codec::{response_code, ControlMessage};
use echowarp::settings::{DEFAULT_BUFFER_SIZE, COMPARABILITY_VERSION};
use echowarp::{establish, ClientRole, CryptoEngine, Settings};

async fn send_raw(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
}

async fn recv_raw(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("peer did not respond in time")
        .unwrap();
    buf.truncate(n);
    buf
}

/// A correct handshake installs working session key material on the client.
#[tokio::test]
async fn connects_and_installs_session_from_server_reply() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let tcp_port = listener.local_addr().unwrap().port();
    let udp_port = tcp_port + 1;

    let mut settings = Settings::client(udp_port, "127.0.0.1".to_string());
    settings.password = Some("letmein".to_string());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut role = ClientRole::new(settings, shutdown_rx);

    let client_task = tokio::spawn(async move { establish(&mut role).await });

    let (mut stream, _addr) = listener.accept().await.unwrap();
    let mut server_crypto = CryptoEngine::new(true, true, true);

    let client_pem = String::from_utf8(recv_raw(&mut stream).await).unwrap();
    server_crypto.load_peer_public_key(&client_pem).unwrap();
    send_raw(&mut stream, server_crypto.serialized_public_key().unwrap().as_bytes()).await;

    let hello_bytes = recv_raw(&mut stream).await;
    let hello = ControlMessage::decode(&server_crypto.decrypt_asym(&hello_bytes).unwrap()).unwrap();
    assert_eq!(hello.message, BASE64.encode("letmein"));

    let reply = ControlMessage::encode_auth_ok(
        COMPARABILITY_VERSION,
        true,
        true,
        server_crypto.aes_key_base64().unwrap(),
        server_crypto.aes_iv_base64().unwrap(),
        0,
        5,
    );
    let ciphertext = server_crypto.encrypt_asym(&reply.encode().unwrap()).unwrap();
    send_raw(&mut stream, &ciphertext).await;

    let established = client_task.await.unwrap().unwrap();
    assert_eq!(established.session.comparability_version, COMPARABILITY_VERSION);

    let frame = b"pcm payload".to_vec();
    let sealed = server_crypto.seal(&frame).unwrap();
    let opened = established.crypto.open(&sealed).unwrap();
    assert_eq!(opened, frame);
}

/// A version conflict must surface as a fatal error, not a silent retry.
#[tokio::test]
async fn version_conflict_is_fatal() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let tcp_port = listener.local_addr().unwrap().port();
    let udp_port = tcp_port + 1;

    let settings = Settings::client(udp_port, "127.0.0.1".to_string());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut role = ClientRole::new(settings, shutdown_rx);

    let client_task = tokio::spawn(async move { establish(&mut role).await });

    let (mut stream, _addr) = listener.accept().await.unwrap();
    let mut server_crypto = CryptoEngine::new(true, false, false);

    let client_pem = String::from_utf8(recv_raw(&mut stream).await).unwrap();
    server_crypto.load_peer_public_key(&client_pem).unwrap();
    send_raw(&mut stream, server_crypto.serialized_public_key().unwrap().as_bytes()).await;

    let _hello_bytes = recv_raw(&mut stream).await;

    let reply = ControlMessage::encode_status("Conflict", response_code::CONFLICT, "99", 0, 5);
    let ciphertext = server_crypto.encrypt_asym(&reply.encode().unwrap()).unwrap();
    send_raw(&mut stream, &ciphertext).await;

    let result = client_task.await.unwrap();
    assert!(result.is_err());
}
