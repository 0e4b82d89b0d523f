//! The reader task: consumes frames, classifies, and routes
//!
//! One task per connection. Heartbeats are answered inline so a PONG is on
//! the wire before the next frame is processed; everything else JSON is
//! handed to a worker task so the reader never blocks on user callbacks or
//! decoding.

use std::sync::Arc;

use bytes::Bytes;
use castlink_core::envelope::{CastMessage, PayloadType};
use castlink_core::message::rewrite_type_key;
use castlink_core::{ChannelMessage, Response, NS_HEARTBEAT, PLATFORM_RECEIVER_ID};
use prost::Message as _;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use castlink_transport::{TlsReceiver, TlsSender, TransportEvent, TransportReceiver,
    TransportSender};

use crate::channel::ChannelShared;
use crate::listener::CustomEvent;

/// Reader main loop. Exits on transport disconnect, undecodable envelope,
/// or channel teardown; an exit under a healthy channel triggers close.
pub(crate) async fn run(
    shared: Arc<ChannelShared>,
    mut receiver: TlsReceiver,
    sender: TlsSender,
    epoch: u64,
) {
    let pong = prebuilt_pong(&shared.sender_id);

    loop {
        let Some(event) = receiver.recv().await else {
            break;
        };

        match event {
            TransportEvent::Connected => {}
            TransportEvent::Error(e) => {
                // A Disconnected event follows; keep draining until then.
                warn!("{}: transport error: {}", shared.remote_name, e);
            }
            TransportEvent::Disconnected { reason } => {
                debug!(
                    "{}: transport disconnected: {}",
                    shared.remote_name,
                    reason.as_deref().unwrap_or("eof")
                );
                break;
            }
            TransportEvent::Frame(bytes) => {
                let envelope = match CastMessage::decode(bytes.as_ref()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        error!("{}: undecodable envelope: {}", shared.remote_name, e);
                        break;
                    }
                };
                handle_envelope(&shared, &sender, &pong, envelope).await;
            }
        }
    }

    shared.reader_exited(epoch);
}

/// Classify one envelope.
async fn handle_envelope(
    shared: &Arc<ChannelShared>,
    sender: &TlsSender,
    pong: &Bytes,
    envelope: CastMessage,
) {
    match envelope.payload_type() {
        PayloadType::Binary => {
            let payload = Bytes::from(envelope.payload_binary.unwrap_or_default());
            trace!(
                "{}: received a message with binary payload ({} bytes)",
                shared.remote_name,
                payload.len()
            );
            let shared = shared.clone();
            let namespace = envelope.namespace;
            tokio::spawn(async move {
                shared.deliver_custom(CustomEvent::Binary { namespace, payload });
            });
        }
        PayloadType::String => {
            let Some(text) = envelope.payload_utf8.clone() else {
                warn!(
                    "{}: received a STRING message without a payload",
                    shared.remote_name
                );
                return;
            };
            if text.is_empty() {
                trace!(
                    "{}: received an empty string message - ignoring",
                    shared.remote_name
                );
                return;
            }

            let rewritten = rewrite_type_key(&text);

            if envelope.namespace == NS_HEARTBEAT {
                handle_heartbeat(shared, sender, pong, &rewritten).await;
                return;
            }

            trace!("{}: received a string message {}", shared.remote_name, rewritten);
            let shared = shared.clone();
            tokio::spawn(async move {
                dispatch_string(shared, envelope, rewritten);
            });
        }
    }
}

/// PING/PONG are dealt with directly: the PONG reply is written before the
/// reader touches the next frame.
async fn handle_heartbeat(
    shared: &Arc<ChannelShared>,
    sender: &TlsSender,
    pong: &Bytes,
    json: &str,
) {
    let parsed: Value = match serde_json::from_str(json) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                "{}: undecodable heartbeat message: {}",
                shared.remote_name, e
            );
            return;
        }
    };

    match parsed
        .get("responseType")
        .and_then(Value::as_str)
        .unwrap_or_default()
    {
        "PING" => {
            trace!("Received PING from {}, replying with PONG", shared.remote_name);
            if let Err(e) = sender.send(pong.clone()).await {
                warn!(
                    "An error occurred while sending PONG to {}: {}",
                    shared.remote_name, e
                );
            }
        }
        "PONG" => {
            trace!("Received PONG from {}", shared.remote_name);
        }
        other => {
            trace!(
                "Received unexpected heartbeat message of type {:?} from {}",
                other,
                shared.remote_name
            );
        }
    }
}

/// Route one non-heartbeat string message. Runs on a worker task.
fn dispatch_string(shared: Arc<ChannelShared>, envelope: CastMessage, json: String) {
    let parsed: Value = match serde_json::from_str(&json) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                "Error while processing JSON message from {}: {}",
                shared.remote_name, e
            );
            return;
        }
    };

    let request_id = parsed
        .get("requestId")
        .and_then(Value::as_u64)
        .unwrap_or_default();

    // A matched waiter consumes the message. Late replies fall through and
    // are delivered as spontaneous events.
    if request_id > 0 && shared.registry.fulfill(request_id, parsed.clone()) {
        return;
    }

    if is_custom_message(&parsed) {
        shared.deliver_custom(CustomEvent::Text {
            namespace: envelope.namespace,
            payload: envelope.payload_utf8.unwrap_or_default(),
        });
    } else {
        shared.deliver_spontaneous(parsed);
    }
}

/// An application-custom message has no recognised discriminator and no
/// request id.
fn is_custom_message(parsed: &Value) -> bool {
    if let Some(kind) = parsed.get("responseType").and_then(Value::as_str) {
        if Response::is_standard_type(kind) {
            return false;
        }
    }
    parsed.get("requestId").is_none()
}

/// The PONG envelope never changes; encode it once per connection.
fn prebuilt_pong(sender_id: &str) -> Bytes {
    let json = serde_json::to_string(&ChannelMessage::Pong)
        .expect("PONG serialization cannot fail");
    let envelope = CastMessage::utf8(sender_id, PLATFORM_RECEIVER_ID, NS_HEARTBEAT, json);
    Bytes::from(envelope.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn standard_reply_is_not_custom() {
        let parsed = json!({"responseType": "RECEIVER_STATUS", "requestId": 3, "status": {}});
        assert!(!is_custom_message(&parsed));
    }

    #[test]
    fn unmatched_standard_event_is_not_custom() {
        // Spontaneous MEDIA_STATUS without a request id.
        let parsed = json!({"responseType": "MEDIA_STATUS", "status": []});
        assert!(!is_custom_message(&parsed));
    }

    #[test]
    fn app_message_without_id_is_custom() {
        let parsed = json!({"responseType": "MY_APP_EVENT", "data": 1});
        assert!(is_custom_message(&parsed));

        let parsed = json!({"foo": "bar"});
        assert!(is_custom_message(&parsed));
    }

    #[test]
    fn app_message_with_id_is_not_custom() {
        // Carries a requestId, so it is a (late) reply, not a custom event.
        let parsed = json!({"responseType": "MY_APP_EVENT", "requestId": 5});
        assert!(!is_custom_message(&parsed));
    }

    #[test]
    fn pong_envelope_shape() {
        let frame = prebuilt_pong("sender-1");
        let envelope = CastMessage::decode(frame.as_ref()).unwrap();
        assert_eq!(envelope.namespace, NS_HEARTBEAT);
        assert_eq!(envelope.destination_id, PLATFORM_RECEIVER_ID);
        assert_eq!(envelope.payload_utf8.as_deref(), Some("{\"type\":\"PONG\"}"));
    }
}
