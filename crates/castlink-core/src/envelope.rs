//! The binary envelope exchanged with the device
//!
//! Every frame carries exactly one [`CastMessage`], encoded with protocol
//! buffers. The message selects a sub-protocol via its namespace and carries
//! either a UTF-8 JSON payload or an opaque binary payload.
//!
//! The device-authentication handshake rides in [`DeviceAuthMessage`]
//! payloads on the `urn:x-cast:com.google.cast.tp.deviceauth` namespace.

use prost::Message;

use crate::{NS_DEVICE_AUTH, PLATFORM_RECEIVER_ID};

/// Protocol envelope version. `CASTV2_1_0` is the single version in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    Castv2_1_0 = 0,
}

/// Whether the payload is UTF-8 JSON or opaque bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    String = 0,
    Binary = 1,
}

/// The protocol envelope.
///
/// Exactly one of `payload_utf8` / `payload_binary` is populated, matching
/// `payload_type`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CastMessage {
    #[prost(enumeration = "ProtocolVersion", tag = "1")]
    pub protocol_version: i32,
    #[prost(string, tag = "2")]
    pub source_id: String,
    #[prost(string, tag = "3")]
    pub destination_id: String,
    #[prost(string, tag = "4")]
    pub namespace: String,
    #[prost(enumeration = "PayloadType", tag = "5")]
    pub payload_type: i32,
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

impl CastMessage {
    /// Build a STRING envelope carrying a JSON payload.
    pub fn utf8(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv2_1_0 as i32,
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload_type: PayloadType::String as i32,
            payload_utf8: Some(payload.into()),
            payload_binary: None,
        }
    }

    /// Build a BINARY envelope carrying opaque bytes.
    pub fn binary(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv2_1_0 as i32,
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload_type: PayloadType::Binary as i32,
            payload_utf8: None,
            payload_binary: Some(payload),
        }
    }

    /// Build the authentication challenge sent right after the TLS
    /// handshake.
    pub fn auth_challenge(source_id: impl Into<String>) -> Self {
        let auth = DeviceAuthMessage {
            challenge: Some(AuthChallenge::default()),
            ..Default::default()
        };
        Self::binary(
            source_id,
            PLATFORM_RECEIVER_ID,
            NS_DEVICE_AUTH,
            auth.encode_to_vec(),
        )
    }
}

/// Device-authentication payload: a challenge from the sender, answered by
/// the device with either a response or an error.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceAuthMessage {
    #[prost(message, optional, tag = "1")]
    pub challenge: Option<AuthChallenge>,
    #[prost(message, optional, tag = "2")]
    pub response: Option<AuthResponse>,
    #[prost(message, optional, tag = "3")]
    pub error: Option<AuthError>,
}

/// The challenge half of the handshake. All fields are defaulted; sending
/// the empty challenge is sufficient.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthChallenge {
    #[prost(bytes = "vec", optional, tag = "2")]
    pub sender_nonce: Option<Vec<u8>>,
}

/// The device's answer to a challenge. The certificate chain is not
/// verified (trust-any policy), so the fields are carried opaquely.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub client_auth_certificate: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub intermediate_certificate: Vec<Vec<u8>>,
}

/// Authentication failure reported by the device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthError {
    #[prost(enumeration = "AuthErrorType", tag = "1")]
    pub error_type: i32,
}

/// Why the device rejected the challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AuthErrorType {
    InternalError = 0,
    NoTls = 1,
    SignatureAlgorithmUnavailable = 2,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn envelope_roundtrip() {
        let msg = CastMessage::utf8("sender-1", "receiver-0", "urn:x-cast:test", "{\"type\":\"X\"}");
        let bytes = msg.encode_to_vec();
        let decoded = CastMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.payload_type(), PayloadType::String);
        assert_eq!(decoded.payload_utf8.as_deref(), Some("{\"type\":\"X\"}"));
        assert!(decoded.payload_binary.is_none());
    }

    #[test]
    fn binary_envelope_roundtrip() {
        let msg = CastMessage::binary("sender-1", "web-7", "urn:x-cast:app", vec![1, 2, 3]);
        let decoded = CastMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.payload_type(), PayloadType::Binary);
        assert_eq!(decoded.payload_binary.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(decoded.payload_utf8.is_none());
    }

    #[test]
    fn auth_challenge_envelope() {
        let msg = CastMessage::auth_challenge("sender-1");
        assert_eq!(msg.destination_id, PLATFORM_RECEIVER_ID);
        assert_eq!(msg.namespace, NS_DEVICE_AUTH);
        assert_eq!(msg.payload_type(), PayloadType::Binary);

        let auth =
            DeviceAuthMessage::decode(msg.payload_binary.as_deref().unwrap()).unwrap();
        assert!(auth.challenge.is_some());
        assert!(auth.response.is_none());
        assert!(auth.error.is_none());
    }

    #[test]
    fn auth_error_roundtrip() {
        let auth = DeviceAuthMessage {
            error: Some(AuthError {
                error_type: AuthErrorType::NoTls as i32,
            }),
            ..Default::default()
        };
        let decoded = DeviceAuthMessage::decode(auth.encode_to_vec().as_slice()).unwrap();
        let error = decoded.error.unwrap();
        assert_eq!(error.error_type(), AuthErrorType::NoTls);
    }
}
