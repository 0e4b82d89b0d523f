//! Channel error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors surfaced by the channel.
///
/// Transport-level failures tear the channel down; per-request semantic
/// failures surface only to the caller that issued the request.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Blank host / sender id / remote name at construction
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket read/write failure
    #[error("io error: {0}")]
    Io(String),

    /// Truncated frame or undecodable envelope
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device rejected the authentication challenge
    #[error("authentication failed: {0}")]
    Auth(String),

    /// JSON did not match the expected response kind
    #[error("decode error: {0}")]
    Decode(String),

    /// The receiver replied `INVALID_REQUEST`
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// The receiver replied `LAUNCH_ERROR`
    #[error("application launch error: {0}")]
    LaunchFailed(String),

    /// The receiver replied `LOAD_FAILED`
    #[error("unable to load media")]
    MediaLoadFailed,

    /// The request deadline elapsed without a reply
    #[error("waiting for response timed out")]
    Timeout,

    /// The channel was shut down while the request was pending
    #[error("channel closed")]
    Closed,

    /// Registry/id invariant broken; should be unreachable
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<castlink_core::Error> for ChannelError {
    fn from(e: castlink_core::Error) -> Self {
        match e {
            castlink_core::Error::Io(io) => ChannelError::Io(io.to_string()),
            other => ChannelError::Protocol(other.to_string()),
        }
    }
}

impl From<castlink_transport::TransportError> for ChannelError {
    fn from(e: castlink_transport::TransportError) -> Self {
        ChannelError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Decode(e.to_string())
    }
}
