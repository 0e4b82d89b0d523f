//! Channel Tests (castlink-client)
//!
//! Tests for the channel against a scripted mock device:
//! - Connection lifecycle and authentication
//! - Request/response multiplexing, timeouts, and error translation
//! - Heartbeat behavior
//! - Sub-sessions and reconnect-on-send
//! - Listener event delivery

use std::sync::Arc;
use std::time::Duration;

use castlink_client::{Channel, ChannelBuilder, ChannelError, ChannelState, CustomEvent};
use castlink_core::message::{Media, Request, Volume};
use castlink_core::{Response, NS_RECEIVER, PLATFORM_RECEIVER_ID};
use castlink_test_utils::{wait_for, DeviceConfig, RecordingListener, TestDevice};
use serde_json::json;

async fn connect_to(device: &TestDevice) -> Channel {
    ChannelBuilder::new("127.0.0.1")
        .port(device.port())
        .sender_id("sender-1")
        .connect()
        .await
        .expect("Connect failed")
}

// ============================================================================
// Connection Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_connect_and_status() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    assert!(!channel.is_closed());
    assert_eq!(channel.state(), ChannelState::Connected);

    let status = channel.get_status().await.expect("get_status failed");
    assert_eq!(status.applications[0].app_id, "CC1AD845");
    assert_eq!(status.applications[0].transport_id.as_deref(), Some("web-1"));
    assert_eq!(status.volume.as_ref().unwrap().level, Some(0.8));

    // The request went out on the receiver namespace, addressed to the
    // platform receiver, with a positive request id.
    let request = device
        .received()
        .into_iter()
        .find(|envelope| envelope.namespace == NS_RECEIVER)
        .expect("No receiver-namespace envelope recorded");
    assert_eq!(request.destination_id, PLATFORM_RECEIVER_ID);
    assert_eq!(request.source_id, "sender-1");
    let payload: serde_json::Value =
        serde_json::from_str(request.payload_utf8.as_deref().unwrap()).unwrap();
    assert_eq!(payload["type"], "GET_STATUS");
    assert!(payload["requestId"].as_u64().unwrap() > 0);

    channel.close().await;
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    // Second connect is a no-op on an established channel.
    let reconnected = channel.connect().await.expect("connect failed");
    assert!(!reconnected);
    assert_eq!(device.connections(), 1);

    channel.close().await;
}

#[tokio::test]
async fn test_connect_sends_platform_connect() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    let connected = wait_for(
        || device.connect_destinations().contains(&PLATFORM_RECEIVER_ID.to_string()),
        Duration::from_secs(2),
    )
    .await;
    assert!(connected, "No CONNECT to receiver-0 observed");

    channel.close().await;
}

#[tokio::test]
async fn test_auth_failure() {
    let device = TestDevice::start_with_config(DeviceConfig {
        auth_error: true,
        ..DeviceConfig::default()
    })
    .await;

    let listener = RecordingListener::new();
    let channel = ChannelBuilder::new("127.0.0.1")
        .port(device.port())
        .sender_id("sender-1")
        .listener(listener.clone())
        .build()
        .expect("build failed");

    let result = channel.connect().await;
    assert!(matches!(result, Err(ChannelError::Auth(_))));

    // Channel stays down: no reader, no heartbeat, no listener event.
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert!(channel.is_closed());
    assert!(listener.connection_events().is_empty());

    // No ping ever goes out.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(device.pings_received(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let device = TestDevice::start().await;
    let listener = RecordingListener::new();
    let channel = ChannelBuilder::new("127.0.0.1")
        .port(device.port())
        .sender_id("sender-1")
        .listener(listener.clone())
        .build()
        .expect("build failed");
    channel.connect().await.expect("connect failed");

    channel.close().await;
    channel.close().await;

    assert!(channel.is_closed());
    assert_eq!(listener.connection_events(), vec![true, false]);
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let channel = ChannelBuilder::new("127.0.0.1")
        .port(port)
        .sender_id("sender-1")
        .build()
        .expect("build failed");

    let result = channel.connect().await;
    assert!(matches!(result, Err(ChannelError::Io(_))));
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

// ============================================================================
// Request/Response Tests
// ============================================================================

#[tokio::test]
async fn test_request_timeout() {
    let device = TestDevice::start_with_config(DeviceConfig {
        mute_requests: true,
        ..DeviceConfig::default()
    })
    .await;

    let channel = ChannelBuilder::new("127.0.0.1")
        .port(device.port())
        .sender_id("sender-1")
        .request_timeout(Duration::from_millis(100))
        .connect()
        .await
        .expect("Connect failed");

    let result = channel.get_status().await;
    assert!(matches!(result, Err(ChannelError::Timeout)));

    // The waiter is gone and the channel is still up.
    assert_eq!(channel.pending_requests(), 0);
    assert_eq!(channel.state(), ChannelState::Connected);

    channel.close().await;
}

#[tokio::test]
async fn test_multiplex_out_of_order_replies() {
    let device = TestDevice::start_with_config(DeviceConfig {
        defer_get_status: Some(10),
        ..DeviceConfig::default()
    })
    .await;
    let channel = Arc::new(connect_to(&device).await);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let channel = channel.clone();
        tasks.push(tokio::spawn(async move {
            channel
                .send_request(
                    NS_RECEIVER,
                    Request::GetStatus { request_id: 0 },
                    PLATFORM_RECEIVER_ID,
                )
                .await
        }));
    }

    let mut seen_ids = Vec::new();
    for task in tasks {
        let response = task.await.unwrap().expect("request failed");
        match response {
            Response::ReceiverStatus(status) => {
                // The device tags each deferred reply with its request id;
                // a crossed wire would surface here.
                assert_eq!(
                    status.status.applications[0].session_id.as_deref(),
                    Some(status.request_id.to_string().as_str())
                );
                seen_ids.push(status.request_id);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    seen_ids.sort_unstable();
    seen_ids.dedup();
    assert_eq!(seen_ids.len(), 10, "each waiter must get its own reply");
    assert_eq!(channel.pending_requests(), 0);

    channel.close().await;
}

#[tokio::test]
async fn test_invalid_request_translation() {
    let device = TestDevice::start_with_config(DeviceConfig {
        reject_requests: true,
        ..DeviceConfig::default()
    })
    .await;
    let channel = connect_to(&device).await;

    let result = channel.get_status().await;
    match result {
        Err(ChannelError::BadRequest(reason)) => assert_eq!(reason, "rejected"),
        other => panic!("expected BadRequest, got {:?}", other),
    }

    channel.close().await;
}

#[tokio::test]
async fn test_launch_error_translation() {
    let device = TestDevice::start_with_config(DeviceConfig {
        launch_error: true,
        ..DeviceConfig::default()
    })
    .await;
    let channel = connect_to(&device).await;

    let result = channel.launch("CC1AD845").await;
    match result {
        Err(ChannelError::LaunchFailed(reason)) => assert_eq!(reason, "CANCELLED"),
        other => panic!("expected LaunchFailed, got {:?}", other),
    }

    channel.close().await;
}

#[tokio::test]
async fn test_load_failed_translation() {
    let device = TestDevice::start_with_config(DeviceConfig {
        load_fails: true,
        ..DeviceConfig::default()
    })
    .await;
    let channel = connect_to(&device).await;

    let result = channel
        .load(
            "web-1",
            "session-9",
            Media::new("http://example.com/a.mp4", "video/mp4"),
            true,
            0.0,
            None,
        )
        .await;
    assert!(matches!(result, Err(ChannelError::MediaLoadFailed)));

    channel.close().await;
}

#[tokio::test]
async fn test_close_cancels_pending_requests() {
    let device = TestDevice::start_with_config(DeviceConfig {
        mute_requests: true,
        ..DeviceConfig::default()
    })
    .await;
    let channel = Arc::new(connect_to(&device).await);

    let pending = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.get_status().await })
    };

    // Let the request get registered before closing.
    let registered = wait_for(|| channel.pending_requests() == 1, Duration::from_secs(2)).await;
    assert!(registered, "request never registered");

    channel.close().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ChannelError::Closed)));
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test]
async fn test_app_availability() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    assert!(channel.is_app_available("CC1AD845").await.unwrap());

    channel.close().await;
}

#[tokio::test]
async fn test_set_volume_returns_status() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    let status = channel.set_volume(Volume::level(0.5)).await.unwrap();
    assert!(!status.applications.is_empty());

    channel.close().await;
}

// ============================================================================
// Heartbeat Tests
// ============================================================================

#[tokio::test]
async fn test_heartbeat_ping_sent() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    // First ping fires ~1s after connect; allow generous slack but stay
    // well under one full period.
    let pinged = device.wait_for_pings(1, Duration::from_secs(8)).await;
    assert!(pinged, "No PING observed after connect");

    channel.close().await;
}

#[tokio::test]
async fn test_pong_replied_to_device_ping() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    device.send_ping().await;
    let ponged = device.wait_for_pongs(1, Duration::from_secs(2)).await;
    assert!(ponged, "Client did not answer the device PING with a PONG");

    channel.close().await;
}

#[tokio::test]
async fn test_heartbeat_stops_after_close() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    channel.close().await;
    let baseline = device.pings_received();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        device.pings_received(),
        baseline,
        "PINGs kept flowing after close"
    );
}

// ============================================================================
// Sub-session Tests
// ============================================================================

#[tokio::test]
async fn test_sub_session_connect_sent_once() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    channel.get_media_status("web-1").await.unwrap();
    channel.get_media_status("web-1").await.unwrap();
    channel.play("web-1", "session-9", 1).await.unwrap();

    let connects: Vec<String> = device
        .connect_destinations()
        .into_iter()
        .filter(|destination| destination == "web-1")
        .collect();
    assert_eq!(connects.len(), 1, "CONNECT to web-1 must be sent exactly once");

    channel.close().await;
}

#[tokio::test]
async fn test_media_verbs() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    let status = channel
        .load(
            "web-1",
            "session-9",
            Media::new("http://example.com/a.mp4", "video/mp4"),
            true,
            0.0,
            None,
        )
        .await
        .unwrap()
        .expect("no media status");
    assert_eq!(status.media_session_id, 1);

    let status = channel.pause("web-1", "session-9", 1).await.unwrap().unwrap();
    assert_eq!(
        status.player_state,
        Some(castlink_core::message::PlayerState::Paused)
    );

    let status = channel
        .seek("web-1", "session-9", 1, 30.0, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.current_time, Some(12.5));

    channel.close().await;
}

// ============================================================================
// Reconnect Tests
// ============================================================================

#[tokio::test]
async fn test_reconnect_on_send() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    channel.close().await;
    assert!(channel.is_closed());

    // The next request transparently re-runs connect (auth + platform
    // CONNECT) and then succeeds.
    let status = channel.launch("CC1AD845").await.expect("launch failed");
    assert_eq!(status.applications[0].app_id, "CC1AD845");

    assert_eq!(device.connections(), 2);
    assert_eq!(device.auth_challenges(), 2);
    let platform_connects = device
        .connect_destinations()
        .into_iter()
        .filter(|destination| destination == PLATFORM_RECEIVER_ID)
        .count();
    assert_eq!(platform_connects, 2);

    channel.close().await;
}

#[tokio::test]
async fn test_sub_sessions_not_restored_on_reconnect() {
    let device = TestDevice::start().await;
    let channel = connect_to(&device).await;

    channel.get_media_status("web-1").await.unwrap();
    channel.close().await;

    // Reconnect; the media sub-session is re-ensured lazily by the next
    // media call, not during connect.
    channel.get_status().await.unwrap();
    let connects_after_reconnect = device
        .connect_destinations()
        .into_iter()
        .filter(|destination| destination == "web-1")
        .count();
    assert_eq!(connects_after_reconnect, 1);

    channel.get_media_status("web-1").await.unwrap();
    let connects_after_media = device
        .connect_destinations()
        .into_iter()
        .filter(|destination| destination == "web-1")
        .count();
    assert_eq!(connects_after_media, 2);

    channel.close().await;
}

// ============================================================================
// Listener Delivery Tests
// ============================================================================

#[tokio::test]
async fn test_spontaneous_event_delivery() {
    let device = TestDevice::start().await;
    let listener = RecordingListener::new();
    let channel = ChannelBuilder::new("127.0.0.1")
        .port(device.port())
        .sender_id("sender-1")
        .listener(listener.clone())
        .connect()
        .await
        .expect("Connect failed");

    device
        .push_json(
            castlink_core::NS_MEDIA,
            json!({"type": "MEDIA_STATUS", "status": [{"mediaSessionId": 7}]}),
        )
        .await;

    let delivered = listener
        .wait_for_spontaneous(1, Duration::from_secs(2))
        .await;
    assert!(delivered, "Spontaneous event not delivered");

    let events = listener.spontaneous_events();
    assert_eq!(events[0]["responseType"], "MEDIA_STATUS");

    channel.close().await;
}

#[tokio::test]
async fn test_custom_string_event_delivery() {
    let device = TestDevice::start().await;
    let listener = RecordingListener::new();
    let channel = ChannelBuilder::new("127.0.0.1")
        .port(device.port())
        .sender_id("sender-1")
        .listener(listener.clone())
        .connect()
        .await
        .expect("Connect failed");

    device
        .push_json(
            "urn:x-cast:com.example.custom",
            json!({"type": "MY_APP_EVENT", "data": 5}),
        )
        .await;

    let delivered = listener.wait_for_custom(1, Duration::from_secs(2)).await;
    assert!(delivered, "Custom event not delivered");

    match &listener.custom_events()[0] {
        CustomEvent::Text { namespace, payload } => {
            assert_eq!(namespace, "urn:x-cast:com.example.custom");
            // The original payload is delivered, not the rewritten one.
            assert!(payload.contains("\"type\""));
            assert!(payload.contains("MY_APP_EVENT"));
        }
        other => panic!("expected a Text event, got {:?}", other),
    }

    channel.close().await;
}

#[tokio::test]
async fn test_binary_event_delivery() {
    let device = TestDevice::start().await;
    let listener = RecordingListener::new();
    let channel = ChannelBuilder::new("127.0.0.1")
        .port(device.port())
        .sender_id("sender-1")
        .listener(listener.clone())
        .connect()
        .await
        .expect("Connect failed");

    device
        .push_binary("urn:x-cast:com.example.blob", vec![0xDE, 0xAD, 0xBE, 0xEF])
        .await;

    let delivered = listener.wait_for_custom(1, Duration::from_secs(2)).await;
    assert!(delivered, "Binary event not delivered");

    match &listener.custom_events()[0] {
        CustomEvent::Binary { namespace, payload } => {
            assert_eq!(namespace, "urn:x-cast:com.example.blob");
            assert_eq!(payload.as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        }
        other => panic!("expected a Binary event, got {:?}", other),
    }

    channel.close().await;
}

#[tokio::test]
async fn test_connection_events() {
    let device = TestDevice::start().await;
    let listener = RecordingListener::new();
    let channel = ChannelBuilder::new("127.0.0.1")
        .port(device.port())
        .sender_id("sender-1")
        .listener(listener.clone())
        .connect()
        .await
        .expect("Connect failed");

    assert_eq!(listener.connection_events(), vec![true]);

    channel.close().await;
    assert_eq!(listener.connection_events(), vec![true, false]);
}
