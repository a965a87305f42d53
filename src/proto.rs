//! Wire-shaped message definitions.
//!
//! This crate's `build.rs` skips invoking `protoc` and falls back to hand-written
//! structs rather than assuming a toolchain is present at build time: every shape
//! below is the Rust struct a generated `prost::Message` would produce, hand-written
//! and `serde`-encoded instead.

use serde::{Deserialize, Serialize};

/// `DataMessage.flags` bit for `END_SESSION`.
pub const FLAG_END_SESSION: u32 = 1;
/// `DataMessage.flags` bit for `EXPIRATION_TIMER_UPDATE`.
pub const FLAG_EXPIRATION_TIMER_UPDATE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    Unknown,
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    Receipt,
}

/// Outer relay-layer frame carrying encrypted inner content plus source metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub r#type: EnvelopeType,
    pub source: String,
    pub source_device: u32,
    /// Unix millis. Some upstream libraries surface this as a boxed "Long" object
    /// instead of a native integer; this crate pins it to plain `i64`.
    pub timestamp: i64,
    pub content: Option<Vec<u8>>,
    pub legacy_message: Option<Vec<u8>>,
}

/// Wire shape of a `PREKEY_BUNDLE`-typed envelope's `content`: the X3DH material a
/// responder needs to bootstrap a session (`RatchetSession::init_incoming`), plus the
/// inner ratchet frame that material decrypts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyWhisperMessage {
    pub registration_id: u32,
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub identity_key: [u8; 32],
    pub message: Vec<u8>,
}

/// The outer decrypted wrapper around a single message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    pub data_message: Option<DataMessage>,
    pub sync_message: Option<SyncMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPointer {
    pub id: String,
    pub content_type: String,
    pub key: Vec<u8>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMessage {
    /// The Exchange payload JSON, UTF-8 encoded.
    pub body: Option<String>,
    pub attachments: Vec<AttachmentPointer>,
    pub flags: u32,
    pub expiration_timer: Option<u32>,
    pub timestamp: i64,
}

impl DataMessage {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessageSent {
    pub destination: Option<String>,
    pub timestamp: i64,
    pub message: DataMessage,
    pub expiration_start_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessageRead {
    pub timestamp: i64,
    pub sender: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMessageRequest {
    pub kind: Option<String>,
}

/// Deprecated/unsupported sync sub-messages this crate still recognizes so callers
/// can log-and-skip them rather than fail `Content` decoding outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeprecatedSync {
    Blocked,
    Contacts,
    Groups,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMessage {
    pub sent: Option<SyncMessageSent>,
    pub read: Vec<SyncMessageRead>,
    pub request: Option<SyncMessageRequest>,
    pub deprecated: Option<DeprecatedSync>,
}

/// First message a provisioning websocket sends: the freshly-created account's uuid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningUuid {
    pub uuid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebSocketMessageType {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketRequestMessage {
    pub id: u64,
    pub verb: String,
    pub path: String,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketResponseMessage {
    pub id: u64,
    pub status: u16,
    pub message: String,
    pub body: Option<Vec<u8>>,
}

/// The framed sub-protocol carried over a single websocket connection (see
/// `WebSocketResource`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WebSocketMessage {
    Request(WebSocketRequestMessage),
    Response(WebSocketResponseMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_message_flags() {
        let msg = DataMessage {
            body: None,
            attachments: vec![],
            flags: FLAG_END_SESSION,
            expiration_timer: None,
            timestamp: 0,
        };
        assert!(msg.has_flag(FLAG_END_SESSION));
        assert!(!msg.has_flag(FLAG_EXPIRATION_TIMER_UPDATE));
    }

    #[test]
    fn websocket_message_roundtrips_through_json() {
        let req = WebSocketMessage::Request(WebSocketRequestMessage {
            id: 42,
            verb: "GET".into(),
            path: "/v1/keepalive".into(),
            body: None,
        });
        let encoded = serde_json::to_vec(&req).unwrap();
        let decoded: WebSocketMessage = serde_json::from_slice(&encoded).unwrap();
        match decoded {
            WebSocketMessage::Request(r) => assert_eq!(r.id, 42),
            _ => panic!("expected request variant"),
        }
    }
}
