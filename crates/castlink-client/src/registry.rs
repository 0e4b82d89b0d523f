//! Pending-request registry
//!
//! Maps request ids to one-shot waiters. The reader fulfils entries as
//! replies arrive; callers time entries out; channel teardown cancels
//! everything left. Every registered id completes exactly once.

use std::sync::atomic::{AtomicU64, Ordering};

use castlink_core::Response;
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ChannelError, Result};

/// The completion side of a registered waiter.
type Waiter = oneshot::Sender<Result<Response>>;

/// Concurrent request-id allocator and waiter table.
pub struct RequestRegistry {
    /// Monotonically increasing. Seeded with a uniformly random value in
    /// `[1, 65536]` so ids don't collide across a restart and never start
    /// at 0 (which means "no id" on the wire).
    next_id: AtomicU64,
    pending: DashMap<u64, Waiter>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        let seed = rand::thread_rng().gen_range(1..=65536u64);
        Self {
            next_id: AtomicU64::new(seed),
            pending: DashMap::new(),
        }
    }

    /// Next value of the request-id counter.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert a waiter for `id` and return the handle the caller awaits.
    ///
    /// A duplicate id would indicate a counter bug.
    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<Response>>> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ChannelError::Internal(format!(
                "request id {} already registered",
                id
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Complete the waiter for `id` with the decoded reply.
    ///
    /// Returns `false` when no waiter matches, in which case the message
    /// belongs to the spontaneous-event path. A reply that fails to decode
    /// completes the waiter with a decode error; the channel stays up.
    pub fn fulfill(&self, id: u64, reply: Value) -> bool {
        let Some((_, waiter)) = self.pending.remove(&id) else {
            return false;
        };

        let result = Response::from_value(reply)
            .map_err(|e| ChannelError::Decode(e.to_string()));
        let _ = waiter.send(result);
        true
    }

    /// Drop the waiter for `id` without completing it (timeout or write
    /// failure on the caller's side).
    pub fn discard(&self, id: u64) {
        self.pending.remove(&id);
    }

    /// Complete every pending waiter with [`ChannelError::Closed`].
    /// Called on channel teardown.
    pub fn cancel_all(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(ChannelError::Closed));
            }
        }
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_strictly_increasing() {
        let registry = RequestRegistry::new();
        let first = registry.allocate_id();
        let second = registry.allocate_id();
        let third = registry.allocate_id();
        assert!(first >= 1 && first <= 65536);
        assert_eq!(second, first + 1);
        assert_eq!(third, first + 2);
    }

    #[test]
    fn duplicate_registration_is_internal_error() {
        let registry = RequestRegistry::new();
        let id = registry.allocate_id();
        let _rx = registry.register(id).unwrap();
        assert!(matches!(
            registry.register(id),
            Err(ChannelError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn fulfill_routes_to_waiter() {
        let registry = RequestRegistry::new();
        let id = registry.allocate_id();
        let rx = registry.register(id).unwrap();

        let routed = registry.fulfill(
            id,
            json!({"responseType": "RECEIVER_STATUS", "requestId": id, "status": {}}),
        );
        assert!(routed);
        assert_eq!(registry.pending_count(), 0);

        match rx.await.unwrap() {
            Ok(Response::ReceiverStatus(response)) => assert_eq!(response.request_id, id),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn fulfill_decode_failure_reaches_waiter() {
        let registry = RequestRegistry::new();
        let id = registry.allocate_id();
        let rx = registry.register(id).unwrap();

        // RECEIVER_STATUS without its mandatory status field.
        let routed = registry.fulfill(
            id,
            json!({"responseType": "RECEIVER_STATUS", "requestId": id}),
        );
        assert!(routed);
        assert!(matches!(rx.await.unwrap(), Err(ChannelError::Decode(_))));
    }

    #[test]
    fn fulfill_without_waiter_reports_unrouted() {
        let registry = RequestRegistry::new();
        assert!(!registry.fulfill(999, json!({"responseType": "PONG"})));
    }

    #[tokio::test]
    async fn cancel_all_completes_with_closed() {
        let registry = RequestRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        let rx_a = registry.register(a).unwrap();
        let rx_b = registry.register(b).unwrap();

        registry.cancel_all();
        assert_eq!(registry.pending_count(), 0);

        assert!(matches!(rx_a.await.unwrap(), Err(ChannelError::Closed)));
        assert!(matches!(rx_b.await.unwrap(), Err(ChannelError::Closed)));
    }

    #[test]
    fn discard_removes_entry() {
        let registry = RequestRegistry::new();
        let id = registry.allocate_id();
        let _rx = registry.register(id).unwrap();
        registry.discard(id);
        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.fulfill(id, json!({"responseType": "PONG"})));
    }
}
