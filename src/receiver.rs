//! Drives a persistent consumer of the message websocket: decrypts envelopes,
//! dispatches to content/sync/receipt handlers, and recovers from session errors.

use crate::address::Address;
use crate::client::SignalClient;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::proto::{Content, Envelope, EnvelopeType, PreKeyWhisperMessage, FLAG_END_SESSION};
use crate::sender::MessageSender;
use crate::signal::identity::IdentityKeyPair;
use crate::signal::session::{RatchetSession, SessionCipher};
use crate::store::{KeyStore, KeyStoreExt};
use crate::util::crypto::{aes_cbc_decrypt, constant_time_eq, hmac_sha256};
use crate::ws::{RequestHandler, Responder, WebSocketResource};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    Message { timestamp: i64, source: Address, message: Content, key_change: bool },
    Sent { source: Address, timestamp: i64, destination: Option<String>, message: Content },
    Read { timestamp: i64, sender: String, source: Address },
    KeyChange { addr: Address, identity_key: [u8; 32] },
    Error { reason: String },
}

pub type ReceiveEventSender = tokio::sync::mpsc::UnboundedSender<ReceiveEvent>;

/// Decrypt the websocket-layer envelope encryption: `[version:1=0x01][iv:16]
/// [ciphertext:N][mac:10]`, AES-256-CBC + HMAC-SHA256 truncated to 10 bytes, keys
/// derived from the 52-byte `signalingKey` (`AES = [0..32]`, `HMAC = [32..52]`).
pub fn decrypt_websocket_message(body: &[u8], signaling_key: &[u8]) -> Result<Vec<u8>> {
    if signaling_key.len() != 52 {
        return Err(Error::Crypto("signalingKey must be 52 bytes".to_string()));
    }
    if body.len() < 1 + 16 + 10 {
        return Err(Error::Crypto("websocket envelope too short".to_string()));
    }
    let aes_key = &signaling_key[0..32];
    let mac_key = &signaling_key[32..52];

    let mac_offset = body.len() - 10;
    let (mac_input, mac) = body.split_at(mac_offset);
    let expected_mac = hmac_sha256(mac_key, mac_input, 10)?;
    if !constant_time_eq(&expected_mac, mac) {
        return Err(Error::Crypto("websocket envelope MAC mismatch".to_string()));
    }

    let version = mac_input[0];
    if version != 0x01 {
        return Err(Error::Crypto(format!("unsupported websocket envelope version {}", version)));
    }
    let iv = &mac_input[1..17];
    let ciphertext = &mac_input[17..];
    aes_cbc_decrypt(aes_key, iv, ciphertext)
}

/// Tracks `(source, source_device, timestamp)` triples already delivered, so a
/// duplicate redelivery is dropped rather than re-emitted.
#[derive(Default)]
struct DedupeLedger {
    seen: Mutex<HashSet<(String, u32, i64)>>,
}

impl DedupeLedger {
    async fn check_and_record(&self, source: &str, device: u32, timestamp: i64) -> bool {
        let mut seen = self.seen.lock().await;
        !seen.insert((source.to_string(), device, timestamp))
    }
}

struct MessageRequestHandler {
    receiver: Arc<MessageReceiverInner>,
}

#[async_trait]
impl RequestHandler for MessageRequestHandler {
    async fn handle(&self, request: crate::proto::WebSocketRequestMessage, responder: Responder) {
        match request.path.as_str() {
            "/api/v1/queue/empty" => {
                let _ = responder.respond(200, "OK");
            }
            "/api/v1/message" => {
                let Some(body) = request.body else {
                    let _ = responder.respond(400, "missing body");
                    return;
                };
                let signaling_key = self.receiver.signaling_key.clone();
                match decrypt_websocket_message(&body, &signaling_key) {
                    Ok(plaintext) => match serde_json::from_slice::<Envelope>(&plaintext) {
                        Ok(envelope) => {
                            self.receiver.handle_envelope(envelope, false, false).await;
                            let _ = responder.respond(200, "OK");
                        }
                        Err(e) => {
                            error!(error = %e, "failed to decode envelope");
                            let _ = responder.respond(500, "bad envelope");
                        }
                    },
                    Err(e) => {
                        error!(error = %e, "websocket-layer decrypt failed");
                        let _ = self.receiver.events.send(ReceiveEvent::Error { reason: e.to_string() });
                        let _ = responder.respond(500, "decrypt failed");
                    }
                }
            }
            _ => {
                let _ = responder.respond(400, "unsupported path");
                error!(path = %request.path, "unexpected websocket request path");
            }
        }
    }
}

struct MessageReceiverInner {
    store: Arc<dyn KeyStore>,
    signal_client: Arc<SignalClient>,
    sender: Arc<MessageSender>,
    our_addr: Address,
    our_identity: IdentityKeyPair,
    signaling_key: Vec<u8>,
    dedupe: DedupeLedger,
    events: ReceiveEventSender,
}

impl MessageReceiverInner {
    async fn load_session(&self, addr: Address) -> Result<RatchetSession> {
        match self.store.load_session(addr).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(Error::from),
            None => Ok(RatchetSession::new()),
        }
    }

    async fn save_session(&self, addr: Address, session: &RatchetSession) -> Result<()> {
        let bytes = serde_json::to_vec(session)?;
        self.store.store_session(addr, bytes).await
    }

    async fn decrypt_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let user_id = Uuid::parse_str(&envelope.source).map_err(|e| Error::Protocol(format!("bad envelope source: {}", e)))?;
        let addr = Address::new(user_id, Some(envelope.source_device));
        let ciphertext = envelope
            .content
            .as_ref()
            .or(envelope.legacy_message.as_ref())
            .ok_or_else(|| Error::Protocol("envelope carries neither content nor legacyMessage".to_string()))?;

        let mut session = self.load_session(addr).await?;

        let plaintext = if envelope.r#type == EnvelopeType::PrekeyBundle {
            let prekey_message: PreKeyWhisperMessage = serde_json::from_slice(ciphertext)?;
            let our_signed_prekey = self
                .store
                .load_signed_prekey(prekey_message.signed_pre_key_id)
                .await?
                .ok_or_else(|| Error::PreKeyError(format!("unknown signed prekey id {}", prekey_message.signed_pre_key_id)))?;
            let our_one_time_prekey = match prekey_message.pre_key_id {
                Some(id) => self.store.load_prekey(id).await?,
                None => None,
            };
            let sender_ephemeral = crate::signal::session::frame_sender_public(&prekey_message.message)?;
            session.init_incoming(
                prekey_message.identity_key,
                sender_ephemeral,
                &self.our_identity,
                &our_signed_prekey.keypair,
                our_one_time_prekey.as_ref().map(|pk| &pk.keypair),
            )?;
            let plaintext = session.decrypt(&prekey_message.message)?;
            if let Some(id) = prekey_message.pre_key_id {
                self.store.remove_prekey(id).await?;
            }
            plaintext
        } else {
            session.decrypt(ciphertext)?
        };

        self.save_session(addr, &session).await?;
        crate::outgoing::pad::unpad(&plaintext)
    }

    /// Recovery table.
    fn is_duplicate(e: &Error) -> bool {
        matches!(e, Error::MessageCounterError(_))
    }

    fn is_untrusted_identity(e: &Error) -> bool {
        matches!(e, Error::IdentityKeyError { .. })
    }

    fn is_session_error(e: &Error) -> bool {
        matches!(e, Error::SessionError(_) | Error::PreKeyError(_) | Error::SessionInitError(_))
    }

    async fn handle_envelope(&self, envelope: Envelope, reentrant: bool, force_accept_key_change: bool) {
        if self.is_blocked(&envelope.source).await {
            return;
        }

        if self.dedupe.check_and_record(&envelope.source, envelope.source_device, envelope.timestamp).await {
            warn!(source = %envelope.source, timestamp = envelope.timestamp, "duplicate envelope dropped");
            return;
        }

        if envelope.r#type == EnvelopeType::Receipt {
            // Delivery receipts carry no decryptable payload; nothing further to do.
            return;
        }

        let user_id = match Uuid::parse_str(&envelope.source) {
            Ok(u) => u,
            Err(e) => {
                let _ = self.events.send(ReceiveEvent::Error { reason: format!("bad source uuid: {}", e) });
                return;
            }
        };
        let source_addr = Address::new(user_id, Some(envelope.source_device));

        match self.decrypt_envelope(&envelope).await {
            Ok(plaintext) => self.dispatch_content(&envelope, source_addr, &plaintext, force_accept_key_change).await,
            Err(e) if Self::is_duplicate(&e) => {
                warn!(source = %envelope.source, "message counter duplicate");
            }
            Err(e) if Self::is_untrusted_identity(&e) => {
                let identity_key = if let Error::IdentityKeyError { identity_key, .. } = &e {
                    identity_key.clone().try_into().unwrap_or([0u8; 32])
                } else {
                    [0u8; 32]
                };
                let _ = self.events.send(ReceiveEvent::KeyChange { addr: source_addr, identity_key });
                if force_accept_key_change && !reentrant {
                    let user_str = source_addr.user_id.to_string();
                    let _ = self.store.remove_identity(&user_str).await;
                    let _ = self.store.save_identity(&user_str, identity_key).await;
                    Box::pin(self.handle_envelope(envelope, true, force_accept_key_change)).await;
                }
            }
            Err(e) if Self::is_session_error(&e) => {
                warn!(source = %envelope.source, error = %e, "session error, resetting session");
                if let Err(refresh_err) = self.refresh_prekeys().await {
                    warn!(error = %refresh_err, "prekey refresh after session error failed");
                }
                if let Err(close_err) = self.sender.close_session(source_addr, true).await {
                    warn!(error = %close_err, "closeSession after session error failed");
                }
            }
            Err(e) => {
                let _ = self.events.send(ReceiveEvent::Error { reason: e.to_string() });
            }
        }
    }

    async fn dispatch_content(&self, envelope: &Envelope, source_addr: Address, plaintext: &[u8], force_accept_key_change: bool) {
        let _ = force_accept_key_change;
        let content: Content = match serde_json::from_slice(plaintext) {
            Ok(c) => c,
            Err(e) => {
                let _ = self.events.send(ReceiveEvent::Error { reason: format!("bad content payload: {}", e) });
                return;
            }
        };

        if let Some(data) = &content.data_message {
            if data.has_flag(FLAG_END_SESSION) {
                self.handle_end_session(source_addr).await;
            }
            let _ = self.events.send(ReceiveEvent::Message {
                timestamp: envelope.timestamp,
                source: source_addr,
                message: content.clone(),
                key_change: false,
            });
        } else if let Some(sync) = &content.sync_message {
            if source_addr.user_id != self.our_addr.user_id || Some(envelope.source_device) == self.our_addr.device_id {
                warn!("sync message from unexpected source, dropping");
                return;
            }
            if let Some(sent) = &sync.sent {
                let _ = self.events.send(ReceiveEvent::Sent {
                    source: source_addr,
                    timestamp: sent.timestamp,
                    destination: sent.destination.clone(),
                    message: content.clone(),
                });
            }
            for read in &sync.read {
                let _ = self.events.send(ReceiveEvent::Read { timestamp: read.timestamp, sender: read.sender.clone(), source: source_addr });
            }
            if sync.deprecated.is_some() || sync.request.is_some() {
                warn!("deprecated sync sub-message received, ignoring");
            }
        }
    }

    async fn handle_end_session(&self, source_addr: Address) {
        if let Err(e) = self.store.remove_all_sessions(&source_addr.user_id.to_string()).await {
            warn!(error = %e, "failed to close sessions on END_SESSION");
        }
    }

    async fn is_blocked(&self, source: &str) -> bool {
        self.store.has(crate::store::Namespace::Blocked, source).await.unwrap_or(false)
    }

    async fn refresh_prekeys(&self) -> Result<()> {
        let max_id = self.store.get_state_u32(crate::store::state_keys::MAX_PREKEY_ID).await?.unwrap_or(1);
        let identity = &self.our_identity;
        let signed = crate::signal::prekey::SignedPreKey::generate(
            max_id,
            &identity.signing_keypair(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0),
        );
        let signed_wire = crate::client::SignedPreKeyWire {
            key_id: signed.id,
            public_key: STANDARD.encode(signed.keypair.public_bytes()),
            signature: STANDARD.encode(signed.signature),
        };
        self.signal_client
            .refresh_pre_keys_if_low(10, 100, max_id, &identity.public_bytes(), signed_wire)
            .await?;
        Ok(())
    }
}

use crate::store::StateStoreExt;

/// Drives a persistent consumer of the message websocket.
pub struct MessageReceiver {
    inner: Arc<MessageReceiverInner>,
    ws: Mutex<Option<Arc<WebSocketResource>>>,
    config: ClientConfig,
    closing: Arc<AtomicBool>,
}

impl MessageReceiver {
    pub fn new(
        store: Arc<dyn KeyStore>,
        signal_client: Arc<SignalClient>,
        sender: Arc<MessageSender>,
        our_addr: Address,
        our_identity: IdentityKeyPair,
        signaling_key: Vec<u8>,
        config: ClientConfig,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<ReceiveEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let inner = Arc::new(MessageReceiverInner {
            store,
            signal_client,
            sender,
            our_addr,
            our_identity,
            signaling_key,
            dedupe: DedupeLedger::default(),
            events: tx,
        });
        (Self { inner, ws: Mutex::new(None), config, closing: Arc::new(AtomicBool::new(false)) }, rx)
    }

    /// Connect loop: connects, and on unintentional close checks registration
    /// status to distinguish an auth failure from a transient network drop, then
    /// reconnects with unbounded retries. An intentional `close()` exits instead.
    pub async fn connect(self: Arc<Self>, ws_url: String) -> Result<()> {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Ok(());
            }
            let handler = Arc::new(MessageRequestHandler { receiver: self.inner.clone() });
            let resource = match WebSocketResource::connect(&ws_url, handler, "/v1/keepalive", &self.config).await {
                Ok(r) => Arc::new(r),
                Err(e) => {
                    warn!(error = %e, "message websocket connect failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            *self.ws.lock().await = Some(resource.clone());
            resource.closed().await;

            if self.closing.load(Ordering::SeqCst) || resource.is_closing() {
                return Ok(());
            }
            if let Err(e) = self.inner.signal_client.get_my_keys().await {
                warn!(error = %e, "registration check after disconnect failed, will keep retrying");
            }
        }
    }

    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(ws) = self.ws.lock().await.take() {
            ws.close().await;
        }
    }

    /// Fetch-mode alternative to the websocket: poll `GET /v1/messages` until
    /// drained, processing and deleting each envelope as it's handled.
    pub async fn drain(&self) -> Result<()> {
        loop {
            let (envelopes, more) = self.inner.signal_client_fetch_messages().await?;
            for envelope in envelopes {
                let source = envelope.source.clone();
                let timestamp = envelope.timestamp;
                self.inner.handle_envelope(envelope, false, false).await;
                self.inner.signal_client_delete_message(&source, timestamp).await?;
            }
            if !more {
                return Ok(());
            }
        }
    }
}

impl MessageReceiverInner {
    async fn signal_client_fetch_messages(&self) -> Result<(Vec<Envelope>, bool)> {
        let resp = self.signal_client.get_messages().await?;
        Ok((resp.messages, resp.more))
    }

    async fn signal_client_delete_message(&self, source: &str, timestamp: i64) -> Result<()> {
        self.signal_client.delete_message(source, timestamp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::crypto::{aes_cbc_encrypt, random_bytes};

    fn signaling_key() -> Vec<u8> {
        random_bytes(52)
    }

    #[test]
    fn websocket_envelope_roundtrips() {
        let key = signaling_key();
        let aes_key = &key[0..32];
        let mac_key = &key[32..52];
        let iv = random_bytes(16);
        let plaintext = b"hello world";
        let ciphertext = aes_cbc_encrypt(aes_key, &iv, plaintext).unwrap();

        let mut mac_input = vec![0x01u8];
        mac_input.extend_from_slice(&iv);
        mac_input.extend_from_slice(&ciphertext);
        let mac = hmac_sha256(mac_key, &mac_input, 10).unwrap();
        let mut body = mac_input;
        body.extend_from_slice(&mac);

        let decrypted = decrypt_websocket_message(&body, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn websocket_envelope_rejects_flipped_ciphertext_byte() {
        let key = signaling_key();
        let aes_key = &key[0..32];
        let mac_key = &key[32..52];
        let iv = random_bytes(16);
        let ciphertext = aes_cbc_encrypt(aes_key, &iv, b"hello world").unwrap();

        let mut mac_input = vec![0x01u8];
        mac_input.extend_from_slice(&iv);
        mac_input.extend_from_slice(&ciphertext);
        let mac = hmac_sha256(mac_key, &mac_input, 10).unwrap();
        let mut body = mac_input;
        body.extend_from_slice(&mac);
        body[20] ^= 0xFF;

        assert!(decrypt_websocket_message(&body, &key).is_err());
    }
}
