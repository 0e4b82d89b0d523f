//! Error types shared by the protocol core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Frame payload exceeds the sanity cap
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Stream ended in the middle of a frame
    #[error("incomplete message: read {read} of {expected} bytes")]
    IncompleteFrame { read: usize, expected: usize },

    /// Envelope could not be decoded
    #[error("envelope decode error: {0}")]
    Envelope(#[from] prost::DecodeError),

    /// JSON payload could not be parsed or did not match the expected shape
    #[error("payload decode error: {0}")]
    Payload(#[from] serde_json::Error),

    /// An envelope carried the wrong payload type for its namespace
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),

    /// I/O failure while reading or writing a frame
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
