//! Listener bundle: the interface the channel consumes from the embedder
//!
//! Callbacks are invoked from worker tasks and should be treated as
//! potentially concurrent. Implementations must not block for long; hand
//! heavy work off to their own tasks.

use bytes::Bytes;
use serde_json::Value;

/// An application-defined message the channel does not interpret.
#[derive(Debug, Clone)]
pub enum CustomEvent {
    /// A STRING payload with no standard discriminator and no request id.
    Text { namespace: String, payload: String },
    /// A BINARY payload. Never parsed.
    Binary { namespace: String, payload: Bytes },
}

impl CustomEvent {
    pub fn namespace(&self) -> &str {
        match self {
            CustomEvent::Text { namespace, .. } | CustomEvent::Binary { namespace, .. } => {
                namespace
            }
        }
    }
}

/// Event sinks for a channel.
///
/// All methods default to no-ops so embedders implement only what they
/// care about.
pub trait ChannelListener: Send + Sync {
    /// The channel connected (after auth + CONNECT) or disconnected.
    fn connection_state(&self, connected: bool) {
        let _ = connected;
    }

    /// An unsolicited standard message (e.g. `MEDIA_STATUS`,
    /// `RECEIVER_STATUS`, `CLOSE`), or a reply whose waiter already gave
    /// up. Delivered as the parsed JSON tree.
    fn spontaneous_event(&self, event: Value) {
        let _ = event;
    }

    /// An application-defined string or binary message.
    fn custom_event(&self, event: CustomEvent) {
        let _ = event;
    }
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ChannelListener for NullListener {}
