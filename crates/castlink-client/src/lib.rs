//! Castlink Client
//!
//! A sender channel for Cast v2 devices: one TLS connection carrying the
//! device-auth handshake, multiplexed request/response traffic, periodic
//! heartbeats, and unsolicited events.
//!
//! # Example
//!
//! ```ignore
//! use castlink_client::{Channel, ChannelBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let channel = ChannelBuilder::new("10.0.0.2")
//!         .sender_id("sender-1")
//!         .connect()
//!         .await?;
//!
//!     let status = channel.get_status().await?;
//!     for app in &status.applications {
//!         println!("{}: {:?}", app.app_id, app.display_name);
//!     }
//!
//!     channel.close().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod channel;
pub mod error;
pub mod listener;
pub mod registry;

mod reader;

pub use builder::ChannelBuilder;
pub use channel::{Channel, ChannelState, DEFAULT_REQUEST_TIMEOUT};
pub use error::{ChannelError, Result};
pub use listener::{ChannelListener, CustomEvent, NullListener};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::ChannelBuilder;
    pub use crate::channel::Channel;
    pub use crate::error::{ChannelError, Result};
    pub use crate::listener::{ChannelListener, CustomEvent};
    pub use castlink_core::message::{Media, MediaStatus, ReceiverStatus, Volume};
    pub use castlink_core::Response;
}
