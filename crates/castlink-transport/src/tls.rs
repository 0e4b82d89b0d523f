//! TLS transport implementation
//!
//! Cast devices listen on TLS (default port 8009) with self-signed
//! certificates, so the connector installs a verifier that accepts any
//! server certificate. Messages use length-prefixed framing: each envelope
//! is preceded by a 4-byte big-endian length prefix.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use castlink_core::frame::{decode_frame, encode_frame, DEFAULT_MAX_FRAME};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender};

use async_trait::async_trait;

/// Default channel buffer size for connections
const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// TLS transport configuration
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Maximum frame size in bytes
    pub max_frame_size: usize,
    /// Read buffer size
    pub read_buffer_size: usize,
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            read_buffer_size: 8192,
            keepalive_secs: 30,
        }
    }
}

/// TLS transport connector
pub struct TlsTransport {
    config: TlsConfig,
}

impl TlsTransport {
    pub fn new() -> Self {
        Self {
            config: TlsConfig::default(),
        }
    }

    pub fn with_config(config: TlsConfig) -> Self {
        Self { config }
    }

    /// Connect to a device and spawn the framed IO loop.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(TlsSender, TlsReceiver)> {
        info!("Connecting to {}:{}", host, port);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        // Enable TCP keepalive if configured
        if self.config.keepalive_secs > 0 {
            let socket = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(std::time::Duration::from_secs(self.config.keepalive_secs));
            let _ = socket.set_tcp_keepalive(&keepalive);
        }

        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid host name: {}", e)))?;

        let connector = TlsConnector::from(Arc::new(client_config()));
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let connected = Arc::new(Mutex::new(true));
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Bytes>(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (incoming_tx, incoming_rx) =
            mpsc::channel::<TransportEvent>(DEFAULT_CHANNEL_BUFFER_SIZE);

        let sender = TlsSender {
            tx: outgoing_tx,
            connected: connected.clone(),
        };
        let receiver = TlsReceiver { rx: incoming_rx };

        let max_frame = self.config.max_frame_size;
        let read_buffer = self.config.read_buffer_size;
        let connected_clone = connected.clone();

        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(tls);
            run_tls_io_loop(
                reader,
                writer,
                outgoing_rx,
                incoming_tx,
                max_frame,
                read_buffer,
                connected_clone,
            )
            .await;
        });

        info!("TLS connected to {}:{}", host, port);
        Ok((sender, receiver))
    }
}

impl Default for TlsTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the rustls client config with the trust-any verifier.
fn client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Accept any server certificate.
///
/// Cast devices present self-signed certificates; the protocol predates
/// meaningful pinning on them, so the chain is not verified.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Shared IO loop: frames queued on `outgoing_rx` are written with their
/// length prefix; inbound bytes are deframed and emitted as events. The
/// loop exits when the outbound channel closes (orderly shutdown), the
/// peer disconnects, or the stream errors.
async fn run_tls_io_loop(
    mut reader: ReadHalf<TlsStream<TcpStream>>,
    mut writer: WriteHalf<TlsStream<TcpStream>>,
    mut outgoing_rx: mpsc::Receiver<Bytes>,
    incoming_tx: mpsc::Sender<TransportEvent>,
    max_frame: usize,
    read_buffer: usize,
    connected: Arc<Mutex<bool>>,
) {
    let mut read_buf = BytesMut::with_capacity(read_buffer);

    'io: loop {
        tokio::select! {
            outbound = outgoing_rx.recv() => {
                match outbound {
                    Some(payload) => {
                        let mut frame = BytesMut::with_capacity(4 + payload.len());
                        if let Err(e) = encode_frame(&payload, &mut frame) {
                            error!("Frame encode error: {}", e);
                            break 'io;
                        }
                        if let Err(e) = writer.write_all(&frame).await {
                            error!("TLS write error: {}", e);
                            let _ = incoming_tx.send(TransportEvent::Disconnected {
                                reason: Some(e.to_string()),
                            }).await;
                            break 'io;
                        }
                        if let Err(e) = writer.flush().await {
                            error!("TLS flush error: {}", e);
                            break 'io;
                        }
                    }
                    // All senders dropped: orderly shutdown.
                    None => {
                        let _ = writer.shutdown().await;
                        break 'io;
                    }
                }
            }

            result = reader.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        debug!("TLS connection closed by peer");
                        let _ = incoming_tx.send(TransportEvent::Disconnected { reason: None }).await;
                        break 'io;
                    }
                    Ok(_) => {
                        loop {
                            match decode_frame(&mut read_buf, max_frame) {
                                Ok(Some(payload)) => {
                                    if incoming_tx.send(TransportEvent::Frame(payload)).await.is_err() {
                                        break 'io;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    error!("Frame decode error: {}", e);
                                    let _ = incoming_tx.send(TransportEvent::Disconnected {
                                        reason: Some(e.to_string()),
                                    }).await;
                                    break 'io;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("TLS read error: {}", e);
                        let _ = incoming_tx.send(TransportEvent::Error(e.to_string())).await;
                        let _ = incoming_tx.send(TransportEvent::Disconnected {
                            reason: Some(e.to_string()),
                        }).await;
                        break 'io;
                    }
                }
            }
        }
    }

    *connected.lock() = false;
}

/// Sender half: queues envelope payloads for framed transmission.
/// Cloneable; all clones feed the single writer task, so frames never
/// interleave.
#[derive(Clone)]
pub struct TlsSender {
    tx: mpsc::Sender<Bytes>,
    connected: Arc<Mutex<bool>>,
}

#[async_trait]
impl TransportSender for TlsSender {
    async fn send(&self, payload: Bytes) -> Result<()> {
        if !*self.connected.lock() {
            return Err(TransportError::NotConnected);
        }

        self.tx
            .send(payload)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    async fn close(&self) -> Result<()> {
        *self.connected.lock() = false;
        Ok(())
    }
}

/// Receiver half: yields transport events.
pub struct TlsReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for TlsReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TlsConfig::default();
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME);
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.keepalive_secs, 30);
    }

    #[test]
    fn client_config_builds() {
        // The dangerous-verifier config must construct without a root store.
        let _ = client_config();
    }
}
