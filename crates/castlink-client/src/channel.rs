//! The channel: a long-lived, multiplexed session with one device
//!
//! One TLS connection carries everything: the binary auth handshake, JSON
//! control traffic, heartbeats, and opaque application messages. Requests
//! are correlated to replies by id; unsolicited traffic goes to the
//! listener bundle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use castlink_core::envelope::{CastMessage, DeviceAuthMessage};
use castlink_core::message::{
    AppAvailabilityResponse, CastRequest, ChannelMessage, Media, MediaStatus, MediaVolume,
    MediaVolumeRequest, ReceiverStatus, Request, ResumeState, StopMediaRequest, Volume,
    APP_AVAILABLE,
};
use castlink_core::{Response, NS_CONNECTION, NS_HEARTBEAT, NS_MEDIA, NS_RECEIVER,
    PLATFORM_RECEIVER_ID};
use dashmap::DashSet;
use parking_lot::Mutex;
use prost::Message as _;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{ChannelError, Result};
use crate::listener::{ChannelListener, CustomEvent};
use crate::reader;
use crate::registry::RequestRegistry;

use castlink_transport::{TlsSender, TlsTransport, TransportEvent, TransportReceiver,
    TransportSender};

/// Period between outbound pings.
pub(crate) const PING_PERIOD: Duration = Duration::from_secs(10);

/// Delay before the first ping after connect.
pub(crate) const PING_DELAY: Duration = Duration::from_secs(1);

/// Default time to wait until a request is answered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Handshaking,
    Connected,
    Closing,
}

/// Socket-lifecycle guarded state: the outbound sender handle plus the
/// reader/heartbeat task handles, all swapped together.
struct Link {
    state: ChannelState,
    /// Bumped on every connection attempt. A reader carries the epoch it
    /// was spawned under, so a straggler from a dead connection can't tear
    /// down its successor.
    epoch: u64,
    sender: Option<TlsSender>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// State shared between the façade, the reader task, and the heartbeat.
pub(crate) struct ChannelShared {
    pub(crate) remote_name: String,
    pub(crate) sender_id: String,
    pub(crate) registry: RequestRegistry,
    pub(crate) listener: Arc<dyn ChannelListener>,
    /// Destinations a CONNECT has been sent to on this channel. Additions
    /// only; cleared on teardown.
    sessions: DashSet<String>,
    link: Mutex<Link>,
}

impl ChannelShared {
    pub(crate) fn state(&self) -> ChannelState {
        self.link.lock().state
    }

    fn sender(&self) -> Option<TlsSender> {
        self.link.lock().sender.clone()
    }

    /// Write one pre-encoded envelope through the single writer.
    pub(crate) async fn write_envelope(&self, envelope: &CastMessage) -> Result<()> {
        let sender = self.sender().ok_or(ChannelError::Closed)?;
        sender
            .send(Bytes::from(envelope.encode_to_vec()))
            .await
            .map_err(ChannelError::from)
    }

    /// Serialize `message` as JSON and write it in a STRING envelope.
    async fn write_json<T: Serialize>(
        &self,
        namespace: &str,
        message: &T,
        destination: &str,
    ) -> Result<()> {
        let json = serde_json::to_string(message)?;
        debug!(" s-> {}", json);
        let envelope = CastMessage::utf8(&self.sender_id, destination, namespace, json);
        self.write_envelope(&envelope).await
    }

    pub(crate) fn deliver_spontaneous(&self, event: Value) {
        self.listener.spontaneous_event(event);
    }

    pub(crate) fn deliver_custom(&self, event: CustomEvent) {
        self.listener.custom_event(event);
    }

    /// Tear the link down: cancel the heartbeat, drop the writer, clear
    /// sub-sessions, and fail every pending waiter. Idempotent, and safe
    /// to call from the reader's own failure path (the reader never aborts
    /// itself; it exits right after). With `only_epoch` set, the teardown
    /// applies only while that connection generation is still current.
    pub(crate) fn teardown(&self, notify: bool, abort_reader: bool, only_epoch: Option<u64>) {
        let (heartbeat, reader_task) = {
            let mut link = self.link.lock();
            if let Some(epoch) = only_epoch {
                if link.epoch != epoch {
                    return;
                }
            }
            match link.state {
                ChannelState::Closing => return,
                ChannelState::Disconnected
                    if link.sender.is_none() && link.reader.is_none() =>
                {
                    return;
                }
                _ => {}
            }
            link.state = ChannelState::Closing;
            link.sender = None;
            (link.heartbeat.take(), link.reader.take())
        };

        if let Some(task) = heartbeat {
            task.abort();
        }
        if abort_reader {
            if let Some(task) = reader_task {
                task.abort();
            }
        }

        self.sessions.clear();
        self.registry.cancel_all();
        self.link.lock().state = ChannelState::Disconnected;

        if notify {
            self.listener.connection_state(false);
        }
    }

    /// Called by the reader as its loop exits. A reader dying under a
    /// supposedly healthy channel means the connection failed.
    pub(crate) fn reader_exited(&self, epoch: u64) {
        let failed = {
            let link = self.link.lock();
            link.epoch == epoch
                && matches!(
                    link.state,
                    ChannelState::Connected | ChannelState::Handshaking
                )
        };
        if failed {
            warn!("{}: connection lost, closing channel", self.remote_name);
            self.teardown(true, false, Some(epoch));
        }
    }
}

/// A channel to one device.
///
/// Construct through [`ChannelBuilder`](crate::ChannelBuilder). All
/// operations take `&self`; the channel is internally synchronized.
pub struct Channel {
    host: String,
    port: u16,
    request_timeout: Duration,
    shared: Arc<ChannelShared>,
    /// Serializes connect/close so concurrent callers can't race the
    /// handshake.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Channel {
    pub(crate) fn new(
        host: String,
        port: u16,
        remote_name: String,
        sender_id: String,
        request_timeout: Duration,
        listener: Arc<dyn ChannelListener>,
    ) -> Self {
        Self {
            host,
            port,
            request_timeout,
            shared: Arc::new(ChannelShared {
                remote_name,
                sender_id,
                registry: RequestRegistry::new(),
                listener,
                sessions: DashSet::new(),
                link: Mutex::new(Link {
                    state: ChannelState::Disconnected,
                    epoch: 0,
                    sender: None,
                    reader: None,
                    heartbeat: None,
                }),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a builder.
    pub fn builder(host: &str) -> crate::ChannelBuilder {
        crate::ChannelBuilder::new(host)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.registry.pending_count()
    }

    /// True iff the socket is absent, closed, or not connected.
    pub fn is_closed(&self) -> bool {
        let link = self.shared.link.lock();
        !(link.state == ChannelState::Connected
            && link
                .sender
                .as_ref()
                .map(|sender| sender.is_connected())
                .unwrap_or(false))
    }

    /// Connect and authenticate.
    ///
    /// Returns `Ok(false)` without touching anything when the channel is
    /// already established. On authentication failure the channel is left
    /// DISCONNECTED: no reader, no heartbeat, no listener event.
    pub async fn connect(&self) -> Result<bool> {
        let _gate = self.lifecycle.lock().await;
        if !self.is_closed() {
            return Ok(false);
        }

        // Reap any stale link left by a connection that died without a
        // clean close, so its tasks don't outlive it.
        self.shared.teardown(false, true, None);
        self.shared.link.lock().state = ChannelState::Handshaking;

        match self.establish().await {
            Ok(()) => {
                self.shared.listener.connection_state(true);
                Ok(true)
            }
            Err(e) => {
                self.shared.teardown(false, true, None);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        let epoch = {
            let mut link = self.shared.link.lock();
            link.epoch += 1;
            link.epoch
        };

        let transport = TlsTransport::new();
        let (sender, mut receiver) = transport.connect(&self.host, self.port).await?;

        // Authenticate before anything else is read from the stream.
        let challenge = CastMessage::auth_challenge(&self.shared.sender_id);
        sender
            .send(Bytes::from(challenge.encode_to_vec()))
            .await
            .map_err(ChannelError::from)?;

        let frame = loop {
            match receiver.recv().await {
                Some(TransportEvent::Frame(bytes)) => break bytes,
                Some(TransportEvent::Connected) | Some(TransportEvent::Error(_)) => continue,
                Some(TransportEvent::Disconnected { reason }) => {
                    return Err(ChannelError::Io(
                        reason.unwrap_or_else(|| "disconnected during handshake".to_string()),
                    ));
                }
                None => {
                    return Err(ChannelError::Io(
                        "connection closed during handshake".to_string(),
                    ));
                }
            }
        };

        let envelope = CastMessage::decode(frame.as_ref())
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        let payload = envelope.payload_binary.ok_or_else(|| {
            ChannelError::Protocol("auth response carried no binary payload".to_string())
        })?;
        let auth = DeviceAuthMessage::decode(payload.as_slice())
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        if let Some(error) = auth.error {
            return Err(ChannelError::Auth(format!("{:?}", error.error_type())));
        }

        // Reader and heartbeat own their own sender clones; every clone
        // feeds the single writer task.
        let reader_task = tokio::spawn(reader::run(
            self.shared.clone(),
            receiver,
            sender.clone(),
            epoch,
        ));
        let heartbeat_task = tokio::spawn(run_heartbeat(self.shared.clone(), sender.clone()));

        {
            let mut link = self.shared.link.lock();
            link.sender = Some(sender);
            link.reader = Some(reader_task);
            link.heartbeat = Some(heartbeat_task);
            link.state = ChannelState::Connected;
        }

        // Open the platform session.
        self.shared
            .write_json(NS_CONNECTION, &ChannelMessage::Connect, PLATFORM_RECEIVER_ID)
            .await?;
        self.shared
            .sessions
            .insert(PLATFORM_RECEIVER_ID.to_string());

        Ok(())
    }

    /// Close the channel. Idempotent; pending requests complete with
    /// [`ChannelError::Closed`].
    pub async fn close(&self) {
        let _gate = self.lifecycle.lock().await;
        self.shared.teardown(true, true, None);
    }

    /// Reconnect if the channel is closed. Requests call this before
    /// writing, so a closed channel heals lazily on use.
    async fn ensure_connected(&self) -> Result<()> {
        if self.is_closed() {
            self.connect().await?;
        }
        Ok(())
    }

    /// Open a sub-session to `destination` if this channel hasn't yet.
    /// Platform traffic needs no sub-session beyond the one opened at
    /// connect time.
    async fn ensure_sub_session(&self, destination: &str) -> Result<()> {
        if destination == PLATFORM_RECEIVER_ID {
            return Ok(());
        }
        if self.shared.sessions.insert(destination.to_string()) {
            if let Err(e) = self
                .shared
                .write_json(NS_CONNECTION, &ChannelMessage::Connect, destination)
                .await
            {
                self.shared.sessions.remove(destination);
                return Err(e);
            }
        }
        Ok(())
    }

    /// The unified typed-send primitive: allocate an id, register a
    /// waiter, write the request, and await the correlated reply.
    pub async fn send_request<R: CastRequest>(
        &self,
        namespace: &str,
        mut request: R,
        destination: &str,
    ) -> Result<Response> {
        self.ensure_connected().await?;

        let id = self.shared.registry.allocate_id();
        request.set_request_id(id);
        if request.request_id() != id {
            return Err(ChannelError::Internal(
                "request id getter/setter contract violation".to_string(),
            ));
        }

        let rx = self.shared.registry.register(id)?;
        if let Err(e) = self.shared.write_json(namespace, &request, destination).await {
            self.shared.registry.discard(id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => match reply? {
                Response::InvalidRequest(invalid) => Err(ChannelError::BadRequest(
                    invalid.reason.unwrap_or_default(),
                )),
                Response::LoadFailed => Err(ChannelError::MediaLoadFailed),
                Response::LaunchError(launch) => Err(ChannelError::LaunchFailed(
                    launch.reason.unwrap_or_default(),
                )),
                response => Ok(response),
            },
            // The waiter was dropped without completing: the registry
            // entry went away underneath us, which only teardown does.
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.shared.registry.discard(id);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Fire-and-forget variant: the request still gets an id, but no
    /// waiter is registered and nothing is awaited beyond the write.
    pub async fn send_without_reply<R: CastRequest>(
        &self,
        namespace: &str,
        mut request: R,
        destination: &str,
    ) -> Result<()> {
        self.ensure_connected().await?;

        let id = self.shared.registry.allocate_id();
        request.set_request_id(id);
        if request.request_id() != id {
            return Err(ChannelError::Internal(
                "request id getter/setter contract violation".to_string(),
            ));
        }

        self.shared.write_json(namespace, &request, destination).await
    }

    // ------------------------------------------------------------------
    // Receiver verbs (destination receiver-0)
    // ------------------------------------------------------------------

    /// Current receiver status.
    pub async fn get_status(&self) -> Result<ReceiverStatus> {
        let response = self
            .send_request(
                NS_RECEIVER,
                Request::GetStatus { request_id: 0 },
                PLATFORM_RECEIVER_ID,
            )
            .await?;
        expect_receiver_status(response)
    }

    /// Whether `app_id` is available on the device.
    pub async fn is_app_available(&self, app_id: &str) -> Result<bool> {
        let response = self
            .send_request(
                NS_RECEIVER,
                Request::GetAppAvailability {
                    request_id: 0,
                    app_id: vec![app_id.to_string()],
                },
                PLATFORM_RECEIVER_ID,
            )
            .await?;
        let availability: AppAvailabilityResponse = match response {
            Response::AppAvailability(availability) => availability,
            other => return Err(unexpected_response("GET_APP_AVAILABILITY", &other)),
        };
        Ok(availability
            .availability
            .get(app_id)
            .map(String::as_str)
            == Some(APP_AVAILABLE))
    }

    /// Launch an application; returns the receiver status after.
    pub async fn launch(&self, app_id: &str) -> Result<ReceiverStatus> {
        let response = self
            .send_request(
                NS_RECEIVER,
                Request::Launch {
                    request_id: 0,
                    app_id: app_id.to_string(),
                },
                PLATFORM_RECEIVER_ID,
            )
            .await?;
        expect_receiver_status(response)
    }

    /// Stop the application running under `session_id`.
    pub async fn stop(&self, session_id: &str) -> Result<ReceiverStatus> {
        let response = self
            .send_request(
                NS_RECEIVER,
                Request::Stop {
                    request_id: 0,
                    session_id: session_id.to_string(),
                },
                PLATFORM_RECEIVER_ID,
            )
            .await?;
        expect_receiver_status(response)
    }

    /// Set the receiver volume.
    pub async fn set_volume(&self, volume: Volume) -> Result<ReceiverStatus> {
        let response = self
            .send_request(
                NS_RECEIVER,
                Request::SetVolume {
                    request_id: 0,
                    volume,
                },
                PLATFORM_RECEIVER_ID,
            )
            .await?;
        expect_receiver_status(response)
    }

    // ------------------------------------------------------------------
    // Media verbs (destination = an application's transport id)
    // ------------------------------------------------------------------

    /// Load media into the application at `destination`.
    #[allow(clippy::too_many_arguments)]
    pub async fn load(
        &self,
        destination: &str,
        session_id: &str,
        media: Media,
        autoplay: bool,
        current_time: f64,
        custom_data: Option<HashMap<String, Value>>,
    ) -> Result<Option<MediaStatus>> {
        self.ensure_connected().await?;
        self.ensure_sub_session(destination).await?;
        let response = self
            .send_request(
                NS_MEDIA,
                Request::Load {
                    request_id: 0,
                    session_id: session_id.to_string(),
                    media,
                    autoplay,
                    current_time,
                    custom_data,
                },
                destination,
            )
            .await?;
        expect_media_status(response)
    }

    /// Resume playback.
    pub async fn play(
        &self,
        destination: &str,
        session_id: &str,
        media_session_id: i64,
    ) -> Result<Option<MediaStatus>> {
        self.ensure_connected().await?;
        self.ensure_sub_session(destination).await?;
        let response = self
            .send_request(
                NS_MEDIA,
                Request::Play {
                    request_id: 0,
                    media_session_id,
                    session_id: session_id.to_string(),
                },
                destination,
            )
            .await?;
        expect_media_status(response)
    }

    /// Pause playback.
    pub async fn pause(
        &self,
        destination: &str,
        session_id: &str,
        media_session_id: i64,
    ) -> Result<Option<MediaStatus>> {
        self.ensure_connected().await?;
        self.ensure_sub_session(destination).await?;
        let response = self
            .send_request(
                NS_MEDIA,
                Request::Pause {
                    request_id: 0,
                    media_session_id,
                    session_id: session_id.to_string(),
                },
                destination,
            )
            .await?;
        expect_media_status(response)
    }

    /// Move the playback position.
    pub async fn seek(
        &self,
        destination: &str,
        session_id: &str,
        media_session_id: i64,
        current_time: f64,
        resume_state: Option<ResumeState>,
    ) -> Result<Option<MediaStatus>> {
        self.ensure_connected().await?;
        self.ensure_sub_session(destination).await?;
        let response = self
            .send_request(
                NS_MEDIA,
                Request::Seek {
                    request_id: 0,
                    media_session_id,
                    session_id: session_id.to_string(),
                    current_time,
                    resume_state,
                },
                destination,
            )
            .await?;
        expect_media_status(response)
    }

    /// Current status of the media sessions at `destination`.
    pub async fn get_media_status(&self, destination: &str) -> Result<Option<MediaStatus>> {
        self.ensure_connected().await?;
        self.ensure_sub_session(destination).await?;
        let response = self
            .send_request(NS_MEDIA, Request::GetStatus { request_id: 0 }, destination)
            .await?;
        expect_media_status(response)
    }

    /// Stop and unload the media session.
    pub async fn stop_media(
        &self,
        destination: &str,
        media_session_id: i64,
        custom_data: Option<HashMap<String, Value>>,
    ) -> Result<Option<MediaStatus>> {
        self.ensure_connected().await?;
        self.ensure_sub_session(destination).await?;
        let response = self
            .send_request(
                NS_MEDIA,
                StopMediaRequest::new(media_session_id, custom_data),
                destination,
            )
            .await?;
        expect_media_status(response)
    }

    /// Set the stream volume of one media session.
    pub async fn set_media_volume(
        &self,
        destination: &str,
        session_id: &str,
        media_session_id: i64,
        volume: MediaVolume,
        custom_data: Option<HashMap<String, Value>>,
    ) -> Result<Option<MediaStatus>> {
        self.ensure_connected().await?;
        self.ensure_sub_session(destination).await?;
        let response = self
            .send_request(
                NS_MEDIA,
                MediaVolumeRequest::new(session_id, media_session_id, volume, custom_data),
                destination,
            )
            .await?;
        expect_media_status(response)
    }

    /// Forward an arbitrary request after ensuring the sub-session.
    /// Returns `None` when `expect_reply` is false.
    pub async fn send_generic<R: CastRequest>(
        &self,
        destination: &str,
        namespace: &str,
        request: R,
        expect_reply: bool,
    ) -> Result<Option<Response>> {
        self.ensure_connected().await?;
        self.ensure_sub_session(destination).await?;
        if expect_reply {
            self.send_request(namespace, request, destination)
                .await
                .map(Some)
        } else {
            self.send_without_reply(namespace, request, destination)
                .await
                .map(|()| None)
        }
    }
}

/// Periodic ping. The envelope never changes, so it is encoded once. A
/// write failure is logged; the reader's IO error is what actually closes
/// the channel.
async fn run_heartbeat(shared: Arc<ChannelShared>, sender: TlsSender) {
    let json = serde_json::to_string(&ChannelMessage::Ping)
        .expect("PING serialization cannot fail");
    let ping = CastMessage::utf8(
        &shared.sender_id,
        PLATFORM_RECEIVER_ID,
        NS_HEARTBEAT,
        json,
    );
    let frame = Bytes::from(ping.encode_to_vec());

    let mut interval = tokio::time::interval_at(Instant::now() + PING_DELAY, PING_PERIOD);
    loop {
        interval.tick().await;
        trace!("Pinging {}", shared.remote_name);
        if let Err(e) = sender.send(frame.clone()).await {
            warn!(
                "An error occurred while sending PING to {}: {}",
                shared.remote_name, e
            );
        }
    }
}

fn expect_receiver_status(response: Response) -> Result<ReceiverStatus> {
    match response {
        Response::ReceiverStatus(status) => Ok(status.status),
        other => Err(unexpected_response("RECEIVER_STATUS", &other)),
    }
}

fn expect_media_status(response: Response) -> Result<Option<MediaStatus>> {
    match response {
        Response::MediaStatus(status) => Ok(status.statuses.into_iter().next()),
        other => Err(unexpected_response("MEDIA_STATUS", &other)),
    }
}

fn unexpected_response(expected: &str, got: &Response) -> ChannelError {
    ChannelError::Decode(format!("expected {}, got {:?}", expected, got))
}
