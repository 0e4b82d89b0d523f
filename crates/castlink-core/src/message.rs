//! The JSON control sub-protocol carried in STRING envelopes
//!
//! Outbound traffic is discriminated by a `type` field; the device echoes
//! `type` on replies too. Inbound JSON is rewritten so the discriminator
//! becomes `responseType` before decoding, keeping request- and
//! response-shaped objects apart in the polymorphic decoder.

use std::collections::HashMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Rewrite the first occurrence of the `"type"` key to `"responseType"`.
///
/// Applied to every inbound STRING payload before parsing.
pub fn rewrite_type_key(json: &str) -> String {
    json.replacen("\"type\"", "\"responseType\"", 1)
}

/// A request object: serializable, with a writable request id.
///
/// The channel allocates an id, writes it into the request, and verifies
/// the round-trip before the request leaves the sender.
pub trait CastRequest: Serialize + Send {
    fn request_id(&self) -> u64;
    fn set_request_id(&mut self, id: u64);
}

/// Fire-and-forget control messages that carry no request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    #[serde(rename = "CONNECT")]
    Connect,
    #[serde(rename = "CLOSE")]
    Close,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
}

/// Standard receiver and media requests.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Current status of the receiver or of a media session, depending on
    /// the namespace the request is sent in.
    #[serde(rename = "GET_STATUS", rename_all = "camelCase")]
    GetStatus { request_id: u64 },

    #[serde(rename = "GET_APP_AVAILABILITY", rename_all = "camelCase")]
    GetAppAvailability {
        request_id: u64,
        app_id: Vec<String>,
    },

    #[serde(rename = "LAUNCH", rename_all = "camelCase")]
    Launch { request_id: u64, app_id: String },

    #[serde(rename = "STOP", rename_all = "camelCase")]
    Stop { request_id: u64, session_id: String },

    #[serde(rename = "SET_VOLUME", rename_all = "camelCase")]
    SetVolume { request_id: u64, volume: Volume },

    #[serde(rename = "LOAD", rename_all = "camelCase")]
    Load {
        request_id: u64,
        session_id: String,
        media: Media,
        autoplay: bool,
        current_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        custom_data: Option<HashMap<String, Value>>,
    },

    #[serde(rename = "PLAY", rename_all = "camelCase")]
    Play {
        request_id: u64,
        media_session_id: i64,
        session_id: String,
    },

    #[serde(rename = "PAUSE", rename_all = "camelCase")]
    Pause {
        request_id: u64,
        media_session_id: i64,
        session_id: String,
    },

    #[serde(rename = "SEEK", rename_all = "camelCase")]
    Seek {
        request_id: u64,
        media_session_id: i64,
        session_id: String,
        current_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_state: Option<ResumeState>,
    },
}

impl CastRequest for Request {
    fn request_id(&self) -> u64 {
        match self {
            Request::GetStatus { request_id }
            | Request::GetAppAvailability { request_id, .. }
            | Request::Launch { request_id, .. }
            | Request::Stop { request_id, .. }
            | Request::SetVolume { request_id, .. }
            | Request::Load { request_id, .. }
            | Request::Play { request_id, .. }
            | Request::Pause { request_id, .. }
            | Request::Seek { request_id, .. } => *request_id,
        }
    }

    fn set_request_id(&mut self, id: u64) {
        match self {
            Request::GetStatus { request_id }
            | Request::GetAppAvailability { request_id, .. }
            | Request::Launch { request_id, .. }
            | Request::Stop { request_id, .. }
            | Request::SetVolume { request_id, .. }
            | Request::Load { request_id, .. }
            | Request::Play { request_id, .. }
            | Request::Pause { request_id, .. }
            | Request::Seek { request_id, .. } => *request_id = id,
        }
    }
}

/// `STOP` in the media namespace, addressed by media session id.
///
/// Shares its `type` tag with the receiver-level [`Request::Stop`]; the
/// namespace disambiguates on the wire, so this lives outside the tagged
/// enum.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMediaRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    request_id: u64,
    media_session_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_data: Option<HashMap<String, Value>>,
}

impl StopMediaRequest {
    pub fn new(media_session_id: i64, custom_data: Option<HashMap<String, Value>>) -> Self {
        Self {
            kind: "STOP",
            request_id: 0,
            media_session_id,
            custom_data,
        }
    }
}

impl CastRequest for StopMediaRequest {
    fn request_id(&self) -> u64 {
        self.request_id
    }

    fn set_request_id(&mut self, id: u64) {
        self.request_id = id;
    }
}

/// `SET_VOLUME` in the media namespace (stream volume).
///
/// Same `type`-tag collision story as [`StopMediaRequest`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaVolumeRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    request_id: u64,
    media_session_id: i64,
    session_id: String,
    volume: MediaVolume,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_data: Option<HashMap<String, Value>>,
}

impl MediaVolumeRequest {
    pub fn new(
        session_id: impl Into<String>,
        media_session_id: i64,
        volume: MediaVolume,
        custom_data: Option<HashMap<String, Value>>,
    ) -> Self {
        Self {
            kind: "SET_VOLUME",
            request_id: 0,
            media_session_id,
            session_id: session_id.into(),
            volume,
            custom_data,
        }
    }
}

impl CastRequest for MediaVolumeRequest {
    fn request_id(&self) -> u64 {
        self.request_id
    }

    fn set_request_id(&mut self, id: u64) {
        self.request_id = id;
    }
}

/// Desired player state after a seek completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeState {
    #[serde(rename = "PLAYBACK_START")]
    PlaybackStart,
    #[serde(rename = "PLAYBACK_PAUSE")]
    PlaybackPause,
}

/// Receiver volume. At least one of `level` / `muted` should be set on a
/// SET_VOLUME request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_type: Option<String>,
}

impl Volume {
    pub fn level(level: f64) -> Self {
        Self {
            level: Some(level),
            ..Default::default()
        }
    }

    pub fn muted(muted: bool) -> Self {
        Self {
            muted: Some(muted),
            ..Default::default()
        }
    }
}

/// Stream-level volume for a media session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

/// How the content is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    #[serde(rename = "BUFFERED")]
    Buffered,
    #[serde(rename = "LIVE")]
    Live,
    #[serde(rename = "NONE")]
    None,
}

/// A piece of media to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub content_id: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<StreamType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<HashMap<String, Value>>,
}

impl Media {
    pub fn new(content_id: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            content_type: content_type.into(),
            stream_type: Some(StreamType::Buffered),
            duration: None,
            metadata: None,
            custom_data: None,
        }
    }
}

/// Player state reported in media status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "BUFFERING")]
    Buffering,
    #[serde(rename = "LOADING")]
    Loading,
    #[serde(rename = "PLAYING")]
    Playing,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(other)]
    Unknown,
}

/// Why an idle player became idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdleReason {
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "INTERRUPTED")]
    Interrupted,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(other)]
    Unknown,
}

/// Status of one media session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatus {
    #[serde(default)]
    pub media_session_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_state: Option<PlayerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_reason: Option<IdleReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<MediaVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_media_commands: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<HashMap<String, Value>>,
}

/// A namespace offered by a running application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppNamespace {
    pub name: String,
}

/// A running (or idle-screen) receiver application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Destination id for media traffic to this application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_idle_screen: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<AppNamespace>,
}

/// Top-level receiver status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<Application>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active_input: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_stand_by: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
}

/// `RECEIVER_STATUS` reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatusResponse {
    #[serde(default)]
    pub request_id: u64,
    pub status: ReceiverStatus,
}

/// `MEDIA_STATUS` reply.
///
/// The device is loose about the `status` field: it may be an array, a
/// single object, or absent entirely (in which case the enclosing object
/// itself is the status). All three shapes decode.
#[derive(Debug, Clone)]
pub struct MediaStatusResponse {
    pub request_id: u64,
    pub statuses: Vec<MediaStatus>,
}

impl<'de> Deserialize<'de> for MediaStatusResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let request_id = value
            .get("requestId")
            .and_then(Value::as_u64)
            .unwrap_or_default();

        let statuses = match value.get("status") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| serde_json::from_value(item.clone()))
                .collect::<Result<Vec<MediaStatus>, _>>()
                .map_err(D::Error::custom)?,
            Some(item) => {
                vec![serde_json::from_value(item.clone()).map_err(D::Error::custom)?]
            }
            None => serde_json::from_value::<MediaStatus>(value)
                .map(|status| vec![status])
                .unwrap_or_default(),
        };

        Ok(Self {
            request_id,
            statuses,
        })
    }
}

/// `GET_APP_AVAILABILITY` reply: availability keyed by app id. An app is
/// available iff its value is the literal `"APP_AVAILABLE"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAvailabilityResponse {
    #[serde(default)]
    pub request_id: u64,
    #[serde(default)]
    pub availability: HashMap<String, String>,
}

/// The literal availability value meaning "available".
pub const APP_AVAILABLE: &str = "APP_AVAILABLE";

/// `INVALID_REQUEST` reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRequestResponse {
    #[serde(default)]
    pub request_id: u64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `LAUNCH_ERROR` reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchErrorResponse {
    #[serde(default)]
    pub request_id: u64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Inbound control messages, discriminated by `responseType`.
///
/// Unknown discriminators decode to [`Response::Unknown`] and are delivered
/// as spontaneous events rather than failing the reader.
#[derive(Debug, Clone)]
pub enum Response {
    ReceiverStatus(ReceiverStatusResponse),
    MediaStatus(MediaStatusResponse),
    AppAvailability(AppAvailabilityResponse),
    InvalidRequest(InvalidRequestResponse),
    LaunchError(LaunchErrorResponse),
    LoadFailed,
    Ping,
    Pong,
    Close,
    Unknown(Value),
}

/// Discriminators this decoder recognises as standard protocol traffic.
const STANDARD_RESPONSE_TYPES: &[&str] = &[
    "RECEIVER_STATUS",
    "MEDIA_STATUS",
    "GET_APP_AVAILABILITY",
    "INVALID_REQUEST",
    "LAUNCH_ERROR",
    "LOAD_FAILED",
    "PING",
    "PONG",
    "CLOSE",
];

impl Response {
    /// Whether `kind` is a discriminator of the standard protocol (as
    /// opposed to an application-defined message type).
    pub fn is_standard_type(kind: &str) -> bool {
        STANDARD_RESPONSE_TYPES.contains(&kind)
    }

    /// Decode a parsed (and `responseType`-rewritten) JSON object by its
    /// discriminator.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("responseType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        match kind.as_str() {
            "RECEIVER_STATUS" => serde_json::from_value(value).map(Response::ReceiverStatus),
            "MEDIA_STATUS" => serde_json::from_value(value).map(Response::MediaStatus),
            "GET_APP_AVAILABILITY" => {
                serde_json::from_value(value).map(Response::AppAvailability)
            }
            "INVALID_REQUEST" => serde_json::from_value(value).map(Response::InvalidRequest),
            "LAUNCH_ERROR" => serde_json::from_value(value).map(Response::LaunchError),
            "LOAD_FAILED" => Ok(Response::LoadFailed),
            "PING" => Ok(Response::Ping),
            "PONG" => Ok(Response::Pong),
            "CLOSE" => Ok(Response::Close),
            _ => Ok(Response::Unknown(value)),
        }
    }
}
