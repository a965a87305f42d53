//! The versioned Exchange payload nested inside `DataMessage.body`.
//! Modeled as a tagged-union `Payload` enum rather than dynamic polymorphism over a
//! "versioned Exchange" object: `decode` tries variants in descending
//! version order and returns the highest one it understands.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: String,
    pub device: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    /// The stable "universal" form of the tag expression Atlas resolved, stored so
    /// recipients can see what expression produced this recipient set.
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyItem {
    pub r#type: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadData {
    pub body: Vec<BodyItem>,
    pub control: Option<String>,
    pub actions: Option<serde_json::Value>,
    pub action_options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub size: u64,
    pub r#type: String,
    pub mtime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadV1 {
    pub sender: Sender,
    pub distribution: Distribution,
    pub thread_id: String,
    pub thread_type: String,
    pub thread_title: Option<String>,
    pub message_type: String,
    pub message_id: String,
    pub message_ref: Option<String>,
    pub user_agent: String,
    pub data: PayloadData,
    pub attachments: Option<Vec<AttachmentMeta>>,
}

/// The Exchange payload is transported as a one-element array of versioned objects;
/// readers pick the highest version they support. Encoding is done by hand (rather
/// than relying on an internally-tagged enum derive) so the `version` field is a
/// plain JSON integer, matching the wire format exactly.
#[derive(Debug, Clone)]
pub enum Payload {
    V1(PayloadV1),
}

impl Payload {
    pub fn v1(payload: PayloadV1) -> Self {
        Payload::V1(payload)
    }

    pub fn encode(&self) -> crate::error::Result<String> {
        let Payload::V1(inner) = self;
        let mut value = serde_json::to_value(inner)?;
        value.as_object_mut().expect("PayloadV1 serializes to a JSON object").insert("version".to_string(), serde_json::json!(1));
        Ok(serde_json::to_string(&[value])?)
    }

    /// Parse the body array and return the highest version this crate understands.
    pub fn decode_highest_known(body: &str) -> crate::error::Result<Payload> {
        let raw: Vec<serde_json::Value> = serde_json::from_str(body)?;
        let mut best: Option<Payload> = None;
        let mut best_version = -1i64;
        for item in raw {
            let version = item.get("version").and_then(|v| v.as_i64()).unwrap_or(-1);
            if version <= best_version {
                continue;
            }
            if let Ok(p) = serde_json::from_value::<PayloadV1>(item.clone()) {
                if version == 1 {
                    best = Some(Payload::V1(p));
                    best_version = version;
                }
            }
        }
        best.ok_or_else(|| crate::error::Error::Protocol("no understood Exchange payload version".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PayloadV1 {
        PayloadV1 {
            sender: Sender { user_id: "u".into(), device: 1 },
            distribution: Distribution { expression: "@a".into() },
            thread_id: "t".into(),
            thread_type: "conversation".into(),
            thread_title: None,
            message_type: "content".into(),
            message_id: "m".into(),
            message_ref: None,
            user_agent: "test".into(),
            data: PayloadData { body: vec![BodyItem { r#type: "text/plain".into(), value: "hi".into() }], ..Default::default() },
            attachments: None,
        }
    }

    #[test]
    fn decode_picks_highest_known_version() {
        let payload = Payload::v1(sample());
        let encoded = payload.encode().unwrap();
        let decoded = Payload::decode_highest_known(&encoded);
        assert!(decoded.is_ok());
        match decoded.unwrap() {
            Payload::V1(p) => assert_eq!(p.thread_id, "t"),
        }
    }

    #[test]
    fn decode_ignores_unknown_future_version() {
        let payload = Payload::v1(sample());
        let mut value = serde_json::to_value(match &payload {
            Payload::V1(p) => p,
        })
        .unwrap();
        value.as_object_mut().unwrap().insert("version".to_string(), serde_json::json!(1));
        let future = serde_json::json!({"version": 99, "unsupported": true});
        let encoded = serde_json::to_string(&[value, future]).unwrap();
        let decoded = Payload::decode_highest_known(&encoded).unwrap();
        match decoded {
            Payload::V1(p) => assert_eq!(p.thread_id, "t"),
        }
    }
}
