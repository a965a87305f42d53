//! Orchestrates sends: builds the payload envelope, resolves distribution, fans
//! out to addresses via a per-address serial queue, and emits sync copies to self.

use crate::address::Address;
use crate::client::{AtlasClient, SignalClient};
use crate::error::Result;
use crate::outgoing::events::{SendEvent, SendEventSender};
use crate::outgoing::OutgoingMessage;
use crate::payload::{BodyItem, Payload, PayloadData, PayloadV1};
use crate::proto::{DataMessage, FLAG_END_SESSION};
use crate::signal::identity::IdentityKeyPair;
use crate::store::{KeyStore, KeyStoreExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Current Exchange payload version this crate writes.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub to: String,
    pub thread_id: String,
    pub thread_type: String,
    pub thread_title: Option<String>,
    pub message_id: String,
    pub message_ref: Option<String>,
    pub user_agent: String,
    pub body: Vec<(String, String)>,
    pub attachments: Vec<Vec<u8>>,
    pub distribution: Option<String>,
    pub no_sync: bool,
}

/// Per-address serial queue: a lock-free map from address to a lazily-created
/// per-key mutex, so sends to different addresses never block each other while
/// sends to the same address are strictly serialized.
#[derive(Default)]
struct AddressQueues {
    locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl AddressQueues {
    async fn lock_for(&self, addr: Address) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(addr).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

pub struct MessageSender {
    store: Arc<dyn KeyStore>,
    signal_client: Arc<SignalClient>,
    atlas: Arc<dyn AtlasClient>,
    our_addr: Address,
    our_identity: IdentityKeyPair,
    our_registration_id: u32,
    queues: AddressQueues,
}

impl MessageSender {
    pub fn new(
        store: Arc<dyn KeyStore>,
        signal_client: Arc<SignalClient>,
        atlas: Arc<dyn AtlasClient>,
        our_addr: Address,
        our_identity: IdentityKeyPair,
        our_registration_id: u32,
    ) -> Self {
        Self { store, signal_client, atlas, our_addr, our_identity, our_registration_id, queues: AddressQueues::default() }
    }

    /// Upload every attachment and return their `AttachmentMeta` descriptors.
    async fn upload_attachments(&self, attachments: &[Vec<u8>]) -> Result<Vec<crate::payload::AttachmentMeta>> {
        let mut metas = Vec::with_capacity(attachments.len());
        for (i, bytes) in attachments.iter().enumerate() {
            let id = self.signal_client.put_attachment(bytes.clone()).await?;
            metas.push(crate::payload::AttachmentMeta {
                name: id,
                size: bytes.len() as u64,
                r#type: "application/octet-stream".to_string(),
                mtime: i.to_string(),
            });
        }
        Ok(metas)
    }

    fn build_payload(
        &self,
        options: &SendOptions,
        distribution_expr: &str,
        attachments: Vec<crate::payload::AttachmentMeta>,
    ) -> Result<(String, i64)> {
        let timestamp = now_millis();
        let payload = PayloadV1 {
            sender: crate::payload::Sender { user_id: self.our_addr.user_id.to_string(), device: self.our_addr.device_id.unwrap_or(1) },
            distribution: crate::payload::Distribution { expression: distribution_expr.to_string() },
            thread_id: options.thread_id.clone(),
            thread_type: options.thread_type.clone(),
            thread_title: options.thread_title.clone(),
            message_type: "content".to_string(),
            message_id: options.message_id.clone(),
            message_ref: options.message_ref.clone(),
            user_agent: options.user_agent.clone(),
            data: PayloadData {
                body: options.body.iter().map(|(t, v)| BodyItem { r#type: t.clone(), value: v.clone() }).collect(),
                control: None,
                actions: None,
                action_options: None,
            },
            attachments: if attachments.is_empty() { None } else { Some(attachments) },
        };
        Ok((Payload::v1(payload).encode()?, timestamp))
    }

    /// Resolve distribution (via Atlas if not explicitly provided), scrub our own
    /// user id from the recipient set (compared by UUID only, so a sender's other
    /// devices remain legitimate sync targets), and fan out concurrently across
    /// addresses while serializing per-address.
    pub async fn send(&self, options: SendOptions) -> Result<(SendEventSender, tokio::sync::mpsc::UnboundedReceiver<SendEvent>)> {
        let distribution = match &options.distribution {
            Some(expr) => self.atlas.resolve_tags(expr).await?,
            None => self.atlas.resolve_tags(&options.to).await?,
        };

        let recipients: Vec<Address> = distribution
            .userids
            .iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .filter(|uid| *uid != self.our_addr.user_id)
            .map(Address::all_devices)
            .collect();

        let attachment_metas = self.upload_attachments(&options.attachments).await?;
        if !attachment_metas.is_empty() {
            debug!(count = attachment_metas.len(), "uploaded attachments for outgoing message");
        }
        let (body_json, timestamp) = self.build_payload(&options, &distribution.universal, attachment_metas)?;
        let data_message = DataMessage { body: Some(body_json), attachments: vec![], flags: 0, expiration_timer: None, timestamp };

        let (tx, rx) = crate::outgoing::events::channel();

        for addr in recipients {
            self.spawn_send(addr, data_message.clone(), tx.clone()).await;
        }

        if !options.no_sync {
            self.send_sync_copy(&data_message, &options.thread_id, tx.clone()).await?;
        }

        Ok((tx, rx))
    }

    async fn spawn_send(&self, addr: Address, data_message: DataMessage, events: SendEventSender) {
        let lock = self.queues.lock_for(addr).await;
        let store = self.store.clone();
        let signal_client = self.signal_client.clone();
        let identity = self.our_identity.clone();
        let registration_id = self.our_registration_id;
        let our_addr = self.our_addr;

        tokio::spawn(async move {
            let _guard = lock.lock().await;
            let body = data_message.body.clone().unwrap_or_default();
            let msg = OutgoingMessage::new(store, signal_client, our_addr, identity, registration_id, data_message.timestamp, body.as_bytes(), events);
            let _ = msg.send(addr).await;
        });
    }

    /// Construct a `SyncMessage.Sent` wrapping the already-sent `DataMessage` and
    /// send it to every one of our other devices, re-emitting its `sent`/`error`
    /// events on the caller's stream so observers see one unified stream.
    async fn send_sync_copy(&self, data_message: &DataMessage, thread_id: &str, events: SendEventSender) -> Result<()> {
        let sync = crate::proto::SyncMessage {
            sent: Some(crate::proto::SyncMessageSent {
                destination: Some(thread_id.to_string()),
                timestamp: data_message.timestamp,
                message: data_message.clone(),
                expiration_start_timestamp: None,
            }),
            read: vec![],
            request: None,
            deprecated: None,
        };
        let sync_body = serde_json::to_string(&sync)?;
        let sync_message = DataMessage { body: Some(sync_body), ..data_message.clone() };
        self.spawn_send(self.our_addr, sync_message, events).await;
        Ok(())
    }

    /// Close all open sessions for `addr`, send an `END_SESSION` control message,
    /// await its outcome, then close again: the sent END_SESSION may itself have
    /// reopened a session as a prekey bundle, which must be purged too. Idempotent.
    pub async fn close_session(&self, addr: Address, retransmit: bool) -> Result<()> {
        self.store.remove_all_sessions(&addr.user_id.to_string()).await?;

        let control = serde_json::json!({ "control": "closeSession", "retransmit": retransmit });
        let data_message = DataMessage {
            body: Some(control.to_string()),
            attachments: vec![],
            flags: FLAG_END_SESSION,
            expiration_timer: None,
            timestamp: now_millis(),
        };
        let (tx, mut rx) = crate::outgoing::events::channel();
        self.spawn_send(addr, data_message, tx).await;

        // await sent or error once
        let _ = rx.recv().await;

        self.store.remove_all_sessions(&addr.user_id.to_string()).await
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
