//! Common test helpers for castlink tests
//!
//! This crate provides:
//! - A scripted mock device ([`TestDevice`]) speaking the device side of
//!   the protocol over self-signed TLS
//! - Condition-based waiting (no hardcoded sleeps)
//! - A recording listener for event assertions

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use castlink_client::{ChannelListener, CustomEvent};
use castlink_core::envelope::{
    AuthError, AuthResponse, CastMessage, DeviceAuthMessage, PayloadType,
};
use castlink_core::frame::{decode_frame, encode_frame, DEFAULT_MAX_FRAME};
use castlink_core::{NS_CONNECTION, NS_DEVICE_AUTH, NS_HEARTBEAT, NS_MEDIA, NS_RECEIVER};
use parking_lot::Mutex;
use prost::Message as _;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F>(check: F, max_wait: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        tokio::time::sleep(DEFAULT_CHECK_INTERVAL).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(|| counter.load(Ordering::SeqCst) >= target, max_wait).await
}

// ============================================================================
// Recording listener
// ============================================================================

/// Listener that records every delivered event for later assertions.
#[derive(Default)]
pub struct RecordingListener {
    connection_events: Mutex<Vec<bool>>,
    spontaneous: Mutex<Vec<Value>>,
    custom: Mutex<Vec<CustomEvent>>,
    spontaneous_count: AtomicU32,
    custom_count: AtomicU32,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_events(&self) -> Vec<bool> {
        self.connection_events.lock().clone()
    }

    pub fn spontaneous_events(&self) -> Vec<Value> {
        self.spontaneous.lock().clone()
    }

    pub fn custom_events(&self) -> Vec<CustomEvent> {
        self.custom.lock().clone()
    }

    pub async fn wait_for_spontaneous(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.spontaneous_count, n, max_wait).await
    }

    pub async fn wait_for_custom(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.custom_count, n, max_wait).await
    }
}

impl ChannelListener for RecordingListener {
    fn connection_state(&self, connected: bool) {
        self.connection_events.lock().push(connected);
    }

    fn spontaneous_event(&self, event: Value) {
        self.spontaneous.lock().push(event);
        self.spontaneous_count.fetch_add(1, Ordering::SeqCst);
    }

    fn custom_event(&self, event: CustomEvent) {
        self.custom.lock().push(event);
        self.custom_count.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Test Device - RAII wrapper with proper cleanup
// ============================================================================

/// Scripted behavior for a [`TestDevice`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Reply to the auth challenge with an error instead of a response.
    pub auth_error: bool,
    /// Never answer receiver/media requests (for timeout tests).
    pub mute_requests: bool,
    /// Reply `INVALID_REQUEST` to every receiver/media request.
    pub reject_requests: bool,
    /// Reply `LAUNCH_ERROR` to LAUNCH.
    pub launch_error: bool,
    /// Reply `LOAD_FAILED` to LOAD.
    pub load_fails: bool,
    /// Withhold GET_STATUS replies until this many have accumulated, then
    /// deliver them in reverse order.
    pub defer_get_status: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            auth_error: false,
            mute_requests: false,
            reject_requests: false,
            launch_error: false,
            load_fails: false,
            defer_get_status: None,
        }
    }
}

#[derive(Default)]
struct DeviceStats {
    connections: AtomicU32,
    auth_challenges: AtomicU32,
    pings_received: AtomicU32,
    pongs_received: AtomicU32,
}

/// A mock cast device that automatically cleans up on drop.
///
/// Accepts any number of sequential connections; each gets the full
/// auth-then-traffic treatment. Every received envelope is recorded.
pub struct TestDevice {
    port: u16,
    handle: Option<tokio::task::JoinHandle<()>>,
    stats: Arc<DeviceStats>,
    received: Arc<Mutex<Vec<CastMessage>>>,
    received_count: Arc<AtomicU32>,
    /// Writer into the most recent live connection, for pushing
    /// device-initiated traffic.
    push_tx: Arc<Mutex<Option<mpsc::Sender<CastMessage>>>>,
}

impl TestDevice {
    /// Start a device with default behavior.
    pub async fn start() -> Self {
        Self::start_with_config(DeviceConfig::default()).await
    }

    /// Start a device with scripted behavior.
    pub async fn start_with_config(config: DeviceConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = tls_acceptor();

        let stats = Arc::new(DeviceStats::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_count = Arc::new(AtomicU32::new(0));
        let push_tx = Arc::new(Mutex::new(None));

        let accept_stats = stats.clone();
        let accept_received = received.clone();
        let accept_count = received_count.clone();
        let accept_push = push_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(tls) = acceptor.accept(stream).await else {
                    continue;
                };
                accept_stats.connections.fetch_add(1, Ordering::SeqCst);

                let connection = Connection {
                    config: config.clone(),
                    stats: accept_stats.clone(),
                    received: accept_received.clone(),
                    received_count: accept_count.clone(),
                    deferred_status: Vec::new(),
                };
                connection.run(tls, accept_push.clone()).await;
            }
        });

        Self {
            port,
            handle: Some(handle),
            stats,
            received,
            received_count,
            push_tx,
        }
    }

    /// The port the device listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// How many TLS connections have been accepted.
    pub fn connections(&self) -> u32 {
        self.stats.connections.load(Ordering::SeqCst)
    }

    /// How many auth challenges have been answered.
    pub fn auth_challenges(&self) -> u32 {
        self.stats.auth_challenges.load(Ordering::SeqCst)
    }

    /// Heartbeat pings received from the client.
    pub fn pings_received(&self) -> u32 {
        self.stats.pings_received.load(Ordering::SeqCst)
    }

    /// Heartbeat pongs received from the client (replies to
    /// [`TestDevice::send_ping`]).
    pub fn pongs_received(&self) -> u32 {
        self.stats.pongs_received.load(Ordering::SeqCst)
    }

    /// Every envelope received so far.
    pub fn received(&self) -> Vec<CastMessage> {
        self.received.lock().clone()
    }

    /// CONNECT destinations observed, in order.
    pub fn connect_destinations(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter(|envelope| {
                envelope.namespace == NS_CONNECTION
                    && envelope
                        .payload_utf8
                        .as_deref()
                        .is_some_and(|payload| payload.contains("CONNECT"))
            })
            .map(|envelope| envelope.destination_id.clone())
            .collect()
    }

    /// Wait for the client's heartbeat pings.
    pub async fn wait_for_pings(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.stats.pings_received, n, max_wait).await
    }

    /// Wait for the client's pong replies.
    pub async fn wait_for_pongs(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.stats.pongs_received, n, max_wait).await
    }

    /// Send a device-initiated heartbeat PING.
    pub async fn send_ping(&self) {
        self.push(CastMessage::utf8(
            "receiver-0",
            "*",
            NS_HEARTBEAT,
            json!({"type": "PING"}).to_string(),
        ))
        .await;
    }

    /// Push an arbitrary STRING message to the client.
    pub async fn push_json(&self, namespace: &str, payload: Value) {
        self.push(CastMessage::utf8(
            "receiver-0",
            "*",
            namespace,
            payload.to_string(),
        ))
        .await;
    }

    /// Push an arbitrary BINARY message to the client.
    pub async fn push_binary(&self, namespace: &str, payload: Vec<u8>) {
        self.push(CastMessage::binary("receiver-0", "*", namespace, payload))
            .await;
    }

    async fn push(&self, envelope: CastMessage) {
        let tx = self.push_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(envelope).await;
        }
    }

    /// Stop the device explicitly (also happens on drop).
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TestDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tls_acceptor() -> TlsAcceptor {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(subject_alt_names).expect("cert generation failed");

    let cert_der = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("server tls config failed");

    TlsAcceptor::from(Arc::new(config))
}

/// One live connection's state machine.
struct Connection {
    config: DeviceConfig,
    stats: Arc<DeviceStats>,
    received: Arc<Mutex<Vec<CastMessage>>>,
    received_count: Arc<AtomicU32>,
    /// Withheld GET_STATUS replies: (source_id, request_id).
    deferred_status: Vec<(String, u64)>,
}

impl Connection {
    async fn run(
        mut self,
        tls: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
        push_slot: Arc<Mutex<Option<mpsc::Sender<CastMessage>>>>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(tls);
        let (out_tx, mut out_rx) = mpsc::channel::<CastMessage>(64);
        *push_slot.lock() = Some(out_tx.clone());

        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let mut frame = BytesMut::new();
                if encode_frame(&envelope.encode_to_vec(), &mut frame).is_err() {
                    return;
                }
                if writer.write_all(&frame).await.is_err() {
                    return;
                }
                let _ = writer.flush().await;
            }
        });

        let mut buf = BytesMut::new();
        'conn: loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break 'conn,
                Ok(_) => {}
            }

            loop {
                let payload = match decode_frame(&mut buf, DEFAULT_MAX_FRAME) {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(_) => break 'conn,
                };
                let Ok(envelope) = CastMessage::decode(payload.as_ref()) else {
                    break 'conn;
                };

                self.received.lock().push(envelope.clone());
                self.received_count.fetch_add(1, Ordering::SeqCst);

                if !self.handle_envelope(envelope, &out_tx).await {
                    break 'conn;
                }
            }
        }

        writer_task.abort();
    }

    /// Returns false to drop the connection.
    async fn handle_envelope(
        &mut self,
        envelope: CastMessage,
        out: &mpsc::Sender<CastMessage>,
    ) -> bool {
        if envelope.namespace == NS_DEVICE_AUTH {
            self.stats.auth_challenges.fetch_add(1, Ordering::SeqCst);
            let reply = if self.config.auth_error {
                DeviceAuthMessage {
                    error: Some(AuthError { error_type: 0 }),
                    ..Default::default()
                }
            } else {
                DeviceAuthMessage {
                    response: Some(AuthResponse::default()),
                    ..Default::default()
                }
            };
            let reply = CastMessage::binary(
                "receiver-0",
                envelope.source_id,
                NS_DEVICE_AUTH,
                reply.encode_to_vec(),
            );
            return out.send(reply).await.is_ok();
        }

        if envelope.payload_type() != PayloadType::String {
            return true;
        }
        let Some(text) = envelope.payload_utf8.as_deref() else {
            return true;
        };
        let Ok(parsed) = serde_json::from_str::<Value>(text) else {
            return true;
        };
        let kind = parsed.get("type").and_then(Value::as_str).unwrap_or_default();

        match envelope.namespace.as_str() {
            NS_HEARTBEAT => match kind {
                "PING" => {
                    self.stats.pings_received.fetch_add(1, Ordering::SeqCst);
                    let pong = CastMessage::utf8(
                        "receiver-0",
                        envelope.source_id,
                        NS_HEARTBEAT,
                        json!({"type": "PONG"}).to_string(),
                    );
                    out.send(pong).await.is_ok()
                }
                "PONG" => {
                    self.stats.pongs_received.fetch_add(1, Ordering::SeqCst);
                    true
                }
                _ => true,
            },
            NS_CONNECTION => true,
            NS_RECEIVER | NS_MEDIA => {
                self.handle_request(&envelope, &parsed, kind, out).await
            }
            _ => true,
        }
    }

    async fn handle_request(
        &mut self,
        envelope: &CastMessage,
        parsed: &Value,
        kind: &str,
        out: &mpsc::Sender<CastMessage>,
    ) -> bool {
        if self.config.mute_requests {
            return true;
        }

        let request_id = parsed
            .get("requestId")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        let source = envelope.source_id.clone();

        if self.config.reject_requests {
            return self
                .reply(
                    out,
                    &source,
                    &envelope.namespace,
                    json!({"type": "INVALID_REQUEST", "requestId": request_id, "reason": "rejected"}),
                )
                .await;
        }

        if envelope.namespace == NS_RECEIVER {
            match kind {
                "GET_STATUS" => {
                    if self.config.defer_get_status.is_some() {
                        self.deferred_status.push((source, request_id));
                        return self.flush_deferred(out).await;
                    }
                    let reply = receiver_status_reply(request_id, "CC1AD845");
                    self.reply(out, &source, NS_RECEIVER, reply).await
                }
                "GET_APP_AVAILABILITY" => {
                    let mut availability = serde_json::Map::new();
                    if let Some(ids) = parsed.get("appId").and_then(Value::as_array) {
                        for id in ids.iter().filter_map(Value::as_str) {
                            availability
                                .insert(id.to_string(), Value::from("APP_AVAILABLE"));
                        }
                    }
                    let reply = json!({
                        "type": "GET_APP_AVAILABILITY",
                        "requestId": request_id,
                        "availability": availability,
                    });
                    self.reply(out, &source, NS_RECEIVER, reply).await
                }
                "LAUNCH" => {
                    if self.config.launch_error {
                        let reply = json!({
                            "type": "LAUNCH_ERROR",
                            "requestId": request_id,
                            "reason": "CANCELLED",
                        });
                        return self.reply(out, &source, NS_RECEIVER, reply).await;
                    }
                    let app_id = parsed
                        .get("appId")
                        .and_then(Value::as_str)
                        .unwrap_or("CC1AD845");
                    let reply = receiver_status_reply(request_id, app_id);
                    self.reply(out, &source, NS_RECEIVER, reply).await
                }
                "STOP" | "SET_VOLUME" => {
                    let reply = receiver_status_reply(request_id, "CC1AD845");
                    self.reply(out, &source, NS_RECEIVER, reply).await
                }
                _ => true,
            }
        } else {
            // Media namespace.
            if kind == "LOAD" && self.config.load_fails {
                let reply = json!({"type": "LOAD_FAILED", "requestId": request_id});
                return self.reply(out, &source, NS_MEDIA, reply).await;
            }
            let reply = json!({
                "type": "MEDIA_STATUS",
                "requestId": request_id,
                "status": [{
                    "mediaSessionId": 1,
                    "playerState": if kind == "PAUSE" { "PAUSED" } else { "PLAYING" },
                    "currentTime": 12.5,
                }],
            });
            self.reply(out, &source, NS_MEDIA, reply).await
        }
    }

    /// Deliver withheld GET_STATUS replies in reverse arrival order once
    /// the configured batch size is reached.
    async fn flush_deferred(&mut self, out: &mpsc::Sender<CastMessage>) -> bool {
        let Some(batch) = self.config.defer_get_status else {
            return true;
        };
        if self.deferred_status.len() < batch {
            return true;
        }

        let deferred = std::mem::take(&mut self.deferred_status);
        for (source, request_id) in deferred.into_iter().rev() {
            let mut reply = receiver_status_reply(request_id, "CC1AD845");
            // Tag the reply so tests can check payload/id coherence.
            reply["status"]["applications"][0]["sessionId"] =
                Value::from(request_id.to_string());
            if !self.reply(out, &source, NS_RECEIVER, reply).await {
                return false;
            }
        }
        true
    }

    async fn reply(
        &self,
        out: &mpsc::Sender<CastMessage>,
        destination: &str,
        namespace: &str,
        payload: Value,
    ) -> bool {
        let envelope =
            CastMessage::utf8("receiver-0", destination, namespace, payload.to_string());
        out.send(envelope).await.is_ok()
    }
}

fn receiver_status_reply(request_id: u64, app_id: &str) -> Value {
    json!({
        "type": "RECEIVER_STATUS",
        "requestId": request_id,
        "status": {
            "applications": [{
                "appId": app_id,
                "displayName": "Test App",
                "sessionId": "session-9",
                "transportId": "web-1",
                "statusText": "Ready",
                "namespaces": [{"name": NS_MEDIA}],
            }],
            "volume": {"level": 0.8, "muted": false},
        },
    })
}
