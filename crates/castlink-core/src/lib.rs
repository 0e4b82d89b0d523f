//! Castlink Core
//!
//! Core types and protocol primitives for the Cast v2 control protocol.
//!
//! This crate provides:
//! - The binary envelope exchanged with the device ([`CastMessage`],
//!   [`DeviceAuthMessage`])
//! - Length-prefixed frame encoding/decoding ([`frame`])
//! - The JSON control sub-protocol ([`Request`], [`Response`],
//!   [`ChannelMessage`])

pub mod envelope;
pub mod error;
pub mod frame;
pub mod message;

pub use envelope::{CastMessage, DeviceAuthMessage, PayloadType, ProtocolVersion};
pub use error::{Error, Result};
pub use message::{ChannelMessage, Request, Response};

/// Default device control port.
pub const DEFAULT_PORT: u16 = 8009;

/// The well-known destination for platform-level traffic.
pub const PLATFORM_RECEIVER_ID: &str = "receiver-0";

/// BINARY device-authentication handshake.
pub const NS_DEVICE_AUTH: &str = "urn:x-cast:com.google.cast.tp.deviceauth";

/// Per-destination CONNECT/CLOSE.
pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";

/// PING/PONG.
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";

/// Receiver status, volume, launch/stop, app availability.
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";

/// Media load/play/pause/seek/status.
pub const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";
