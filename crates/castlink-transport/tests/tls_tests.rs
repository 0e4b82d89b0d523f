//! TLS Transport Tests (castlink-transport)
//!
//! Tests for the TLS transport implementation including:
//! - Trust-any certificate acceptance against a self-signed server
//! - Length-prefixed framing across the IO loop
//! - Disconnect event delivery
//! - Oversize frame rejection

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use castlink_core::frame::{decode_frame, encode_frame, DEFAULT_MAX_FRAME};
use castlink_transport::{TlsConfig, TlsTransport, TransportEvent, TransportReceiver, TransportSender};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

// ============================================================================
// Helper Functions
// ============================================================================

fn tls_acceptor() -> TlsAcceptor {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(subject_alt_names).expect("Cert generation failed");

    let cert_der = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("TLS config failed");

    TlsAcceptor::from(Arc::new(config))
}

/// Accept one TLS connection and echo every frame back.
async fn spawn_echo_server() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = tls_acceptor();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let mut buf = BytesMut::new();

        loop {
            match tls.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }

            while let Some(payload) = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap() {
                let mut frame = BytesMut::new();
                encode_frame(&payload, &mut frame).unwrap();
                if tls.write_all(&frame).await.is_err() {
                    return;
                }
                let _ = tls.flush().await;
            }
        }
    });

    (port, handle)
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_connect_accepts_self_signed_cert() {
    let (port, server) = spawn_echo_server().await;

    let transport = TlsTransport::new();
    let result = transport.connect("127.0.0.1", port).await;
    assert!(
        result.is_ok(),
        "Connect should accept a self-signed cert: {:?}",
        result.err()
    );

    server.abort();
}

#[tokio::test]
async fn test_connect_refused() {
    // Nothing listens on the allocated-then-released port.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = TlsTransport::new();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        transport.connect("127.0.0.1", port),
    )
    .await;

    match result {
        Ok(Ok(_)) => panic!("Connect to a closed port should fail"),
        Ok(Err(_)) => {}
        Err(_) => {}
    }
}

// ============================================================================
// Framing Tests
// ============================================================================

#[tokio::test]
async fn test_frame_echo_roundtrip() {
    let (port, server) = spawn_echo_server().await;

    let transport = TlsTransport::new();
    let (sender, mut receiver) = transport.connect("127.0.0.1", port).await.unwrap();

    let payload = Bytes::from_static(b"one whole envelope");
    sender.send(payload.clone()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("Echo should arrive");
    match event {
        Some(TransportEvent::Frame(data)) => assert_eq!(data, payload),
        other => panic!("Unexpected event: {:?}", other),
    }

    server.abort();
}

#[tokio::test]
async fn test_multiple_frames_preserve_order() {
    let (port, server) = spawn_echo_server().await;

    let transport = TlsTransport::new();
    let (sender, mut receiver) = transport.connect("127.0.0.1", port).await.unwrap();

    for i in 0..10u8 {
        sender.send(Bytes::from(vec![i; 8])).await.unwrap();
    }

    for i in 0..10u8 {
        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("Echo should arrive");
        match event {
            Some(TransportEvent::Frame(data)) => {
                assert_eq!(data.as_ref(), &[i; 8], "Frame {} out of order", i)
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    server.abort();
}

// ============================================================================
// Disconnect Tests
// ============================================================================

#[tokio::test]
async fn test_server_close_yields_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = tls_acceptor();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let _ = tls.shutdown().await;
    });

    let transport = TlsTransport::new();
    let (_sender, mut receiver) = transport.connect("127.0.0.1", port).await.unwrap();

    let mut disconnected = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await
    {
        if matches!(event, TransportEvent::Disconnected { .. }) {
            disconnected = true;
            break;
        }
    }
    assert!(disconnected, "Expected a Disconnected event");

    let _ = server.await;
}

#[tokio::test]
async fn test_oversize_frame_disconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = tls_acceptor();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        // Length prefix far beyond the configured cap.
        tls.write_all(&(1024u32 * 1024).to_be_bytes()).await.unwrap();
        tls.write_all(&[0u8; 64]).await.unwrap();
        let _ = tls.flush().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let transport = TlsTransport::with_config(TlsConfig {
        max_frame_size: 64 * 1024,
        ..TlsConfig::default()
    });
    let (_sender, mut receiver) = transport.connect("127.0.0.1", port).await.unwrap();

    let mut reason = None;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await
    {
        if let TransportEvent::Disconnected { reason: r } = event {
            reason = r;
            break;
        }
    }
    assert!(
        reason.unwrap_or_default().contains("too large"),
        "Disconnect should carry the frame-size reason"
    );

    server.abort();
}

#[tokio::test]
async fn test_sender_reports_disconnected_state() {
    let (port, server) = spawn_echo_server().await;

    let transport = TlsTransport::new();
    let (sender, _receiver) = transport.connect("127.0.0.1", port).await.unwrap();
    assert!(sender.is_connected());

    sender.close().await.unwrap();
    assert!(!sender.is_connected());

    let result = sender.send(Bytes::from_static(b"late")).await;
    assert!(result.is_err(), "Send after close should fail");

    server.abort();
}
