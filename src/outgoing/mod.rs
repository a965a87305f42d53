//! Per-message state machine: per-device encryption, stale/extra/missing-device
//! recovery, identity-key-change handling, event emission. The single
//! largest module in the crate; split into `pad` (padding, independently testable)
//! and `events` (the `SendEvent` enum) alongside this state machine.

pub mod events;
pub mod pad;

use crate::address::Address;
use crate::client::{KeysForAddrResponse, OutgoingMessageWire, SignalClient};
use crate::error::{Error, Result};
use crate::signal::identity::IdentityKeyPair;
use crate::signal::prekey::PreKeyBundle;
use crate::signal::session::{RatchetSession, SessionCipher};
use crate::store::{KeyStore, KeyStoreExt};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use events::{KeyChangeDecision, SendError, SendEvent, SendEventSender};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Message type tags carried on the wire alongside the ciphertext (mirrors the
/// Signal envelope's `CIPHERTEXT` / `PREKEY_BUNDLE` distinction).
const TYPE_CIPHERTEXT: i32 = 1;
const TYPE_PREKEY_BUNDLE: i32 = 3;

async fn load_session(store: &dyn KeyStore, addr: Address) -> Result<RatchetSession> {
    match store.load_session(addr).await? {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(Error::from),
        None => Ok(RatchetSession::new()),
    }
}

async fn save_session(store: &dyn KeyStore, addr: Address, session: &RatchetSession) -> Result<()> {
    let bytes = serde_json::to_vec(session)?;
    store.store_session(addr, bytes).await
}

fn decode_bundle(device: &crate::client::DeviceKeysResponse, identity_key: [u8; 32]) -> Result<PreKeyBundle> {
    let signed_pub: [u8; 32] = STANDARD
        .decode(&device.signed_pre_key.public_key)
        .map_err(|e| Error::Protocol(format!("bad base64 signed prekey: {}", e)))?
        .try_into()
        .map_err(|_| Error::PreKeyError("signed prekey public key not 32 bytes".to_string()))?;
    let signature: [u8; 64] = STANDARD
        .decode(&device.signed_pre_key.signature)
        .map_err(|e| Error::Protocol(format!("bad base64 signature: {}", e)))?
        .try_into()
        .map_err(|_| Error::PreKeyError("signed prekey signature not 64 bytes".to_string()))?;

    let (pre_key_id, pre_key_public) = match &device.pre_key {
        Some(pk) => {
            let bytes: [u8; 32] = STANDARD
                .decode(&pk.public_key)
                .map_err(|e| Error::Protocol(format!("bad base64 prekey: {}", e)))?
                .try_into()
                .map_err(|_| Error::PreKeyError("prekey public key not 32 bytes".to_string()))?;
            (Some(pk.key_id), Some(bytes))
        }
        None => (None, None),
    };

    Ok(PreKeyBundle {
        registration_id: device.registration_id,
        device_id: device.device_id,
        pre_key_id,
        pre_key_public,
        signed_pre_key_id: device.signed_pre_key.key_id,
        signed_pre_key_public: signed_pub,
        signed_pre_key_signature: signature,
        identity_key,
    })
}

fn decode_identity_key(resp: &KeysForAddrResponse) -> Result<[u8; 32]> {
    STANDARD
        .decode(&resp.identity_key)
        .map_err(|e| Error::Protocol(format!("bad base64 identity key: {}", e)))?
        .try_into()
        .map_err(|_| Error::Crypto("identity key not 32 bytes".to_string()))
}

/// Drives the send of a single `(timestamp, content)` to one or more addresses.
pub struct OutgoingMessage {
    store: Arc<dyn KeyStore>,
    signal_client: Arc<SignalClient>,
    our_addr: Address,
    our_identity: IdentityKeyPair,
    our_registration_id: u32,
    timestamp: i64,
    padded_content: Vec<u8>,
    events: SendEventSender,
    pub sent: Mutex<Vec<Address>>,
    pub errors: Mutex<Vec<SendError>>,
    pub created: i64,
}

impl OutgoingMessage {
    pub fn new(
        store: Arc<dyn KeyStore>,
        signal_client: Arc<SignalClient>,
        our_addr: Address,
        our_identity: IdentityKeyPair,
        our_registration_id: u32,
        timestamp: i64,
        content: &[u8],
        events: SendEventSender,
    ) -> Self {
        Self {
            store,
            signal_client,
            our_addr,
            our_identity,
            our_registration_id,
            timestamp,
            padded_content: pad::pad(content),
            events,
            sent: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            created: timestamp,
        }
    }

    fn emit(&self, event: SendEvent) {
        let _ = self.events.send(event);
    }

    async fn emit_sent(&self, addr: Address) {
        self.sent.lock().await.push(addr);
        self.emit(SendEvent::Sent { timestamp: self.timestamp, addr });
    }

    async fn emit_error(&self, addr: Address, reason: impl Into<String>, underlying: Error) {
        let err = SendError { addr, reason: reason.into(), underlying: Arc::new(underlying) };
        self.errors.lock().await.push(err.clone());
        self.emit(SendEvent::Error(err));
    }

    /// Public entry point: dispatches to the per-address or per-device algorithm
    /// depending on whether `addr` names a specific device.
    pub async fn send(&self, addr: Address) -> Result<()> {
        match addr.device_id {
            None => self.send_to_addr(addr, true).await,
            Some(dev) => self.send_to_device(addr, dev, true).await,
        }
    }

    /// Per-address algorithm.
    async fn send_to_addr(&self, addr: Address, recurse: bool) -> Result<()> {
        self.init_sessions_for_addr(addr).await?;

        let device_ids = self.store.get_device_ids(&addr.user_id.to_string()).await?;
        let device_ids: Vec<u32> = device_ids
            .into_iter()
            .filter(|&d| !(addr.user_id == self.our_addr.user_id && Some(d) == self.our_addr.device_id))
            .collect();

        let mut messages = Vec::new();
        for dev in &device_ids {
            match self.encrypt_for_device(addr.with_device(*dev)).await {
                Ok(wire) => messages.push(wire),
                Err(e) => {
                    self.emit_error(addr, "encrypt failed", e).await;
                    return Ok(());
                }
            }
        }

        match self.signal_client.send_messages(&addr, messages, self.timestamp).await {
            Ok(()) => {
                self.emit_sent(addr).await;
                Ok(())
            }
            Err(e) => self.recover_send_to_addr(addr, e, recurse).await,
        }
    }

    async fn recover_send_to_addr(&self, addr: Address, err: Error, recurse: bool) -> Result<()> {
        match err.status_code() {
            Some(409) if recurse => {
                match err.protocol_body().and_then(|b| serde_json::from_str::<crate::client::MismatchedDevices>(b).ok()) {
                    Some(mismatched) => {
                        warn!(%addr, extra = ?mismatched.extra_devices, missing = ?mismatched.missing_devices, "mismatched devices, recovering");
                        for dev in &mismatched.extra_devices {
                            self.store.remove_session(addr.with_device(*dev)).await?;
                        }
                        if !mismatched.missing_devices.is_empty() {
                            self.get_keys_for_addr(addr, None, false).await?;
                        }
                    }
                    None => {
                        warn!(%addr, "409 mismatched devices with unparseable body, recovering all sessions");
                        self.store.remove_all_sessions(&addr.user_id.to_string()).await?;
                    }
                }
                Box::pin(self.send_to_addr(addr, false)).await
            }
            Some(410) if recurse => {
                match err.protocol_body().and_then(|b| serde_json::from_str::<crate::client::StaleDevices>(b).ok()) {
                    Some(stale) => {
                        warn!(%addr, stale = ?stale.stale_devices, "stale devices, recovering");
                        for dev in &stale.stale_devices {
                            self.store.remove_session(addr.with_device(*dev)).await?;
                        }
                    }
                    None => {
                        warn!(%addr, "410 stale devices with unparseable body, recovering all sessions");
                        self.store.remove_all_sessions(&addr.user_id.to_string()).await?;
                    }
                }
                Box::pin(self.send_to_addr(addr, false)).await
            }
            Some(404) => {
                self.store.remove_all_sessions(&addr.user_id.to_string()).await?;
                self.emit_error(addr, "unregistered user", Error::UnregisteredUserError { addr }).await;
                Ok(())
            }
            Some(401) | Some(403) => Err(err),
            _ => {
                self.emit_error(addr, "send failed", err).await;
                Ok(())
            }
        }
    }

    /// Per-device algorithm.
    async fn send_to_device(&self, addr: Address, dev: u32, recurse: bool) -> Result<()> {
        let dev_addr = addr.with_device(dev);
        if !self.has_open_session(dev_addr).await? {
            self.get_keys_for_addr(addr, Some(dev), false).await?;
        }

        let wire = match self.encrypt_for_device(dev_addr).await {
            Ok(w) => w,
            Err(e) => {
                self.emit_error(addr, "encrypt failed", e).await;
                return Ok(());
            }
        };

        match self.signal_client.send_message(&addr, dev, wire).await {
            Ok(()) => {
                self.emit_sent(dev_addr).await;
                Ok(())
            }
            Err(e) if e.status_code() == Some(410) && recurse => {
                self.close_session_for(dev_addr).await?;
                Box::pin(self.send_to_device(addr, dev, false)).await
            }
            Err(e) => {
                self.emit_error(addr, "send failed", e).await;
                Ok(())
            }
        }
    }

    async fn has_open_session(&self, dev_addr: Address) -> Result<bool> {
        Ok(self.store.load_session(dev_addr).await?.is_some())
    }

    async fn close_session_for(&self, dev_addr: Address) -> Result<()> {
        self.store.remove_session(dev_addr).await
    }

    /// Initiate sessions for every device of `addr` that doesn't already have one.
    /// Uses a single batched fetch for the whole address when any devices are
    /// missing sessions, skipping our own device id when `addr` is our own address.
    async fn init_sessions_for_addr(&self, addr: Address) -> Result<()> {
        let known_devices = self.store.get_device_ids(&addr.user_id.to_string()).await?;
        let needs_fetch = known_devices.is_empty()
            || {
                let mut missing = false;
                for dev in &known_devices {
                    if !self.has_open_session(addr.with_device(*dev)).await? {
                        missing = true;
                    }
                }
                missing
            };
        if needs_fetch {
            self.get_keys_for_addr(addr, None, false).await?;
        }
        Ok(())
    }

    /// Fetch prekey material and call `init_outgoing` for every returned device.
    /// `device_id = None` fetches for the whole address (batched); `Some(id)`
    /// fetches for a single device. Handles the identity-key-change retry
    /// discipline (one retry via `reentrant`).
    async fn get_keys_for_addr(&self, addr: Address, device_id: Option<u32>, reentrant: bool) -> Result<()> {
        let resp = match self.signal_client.get_keys_for_addr(&addr, device_id).await {
            Ok(r) => r,
            Err(e) if e.status_code() == Some(404) => {
                match device_id {
                    None => self.store.remove_all_sessions(&addr.user_id.to_string()).await?,
                    Some(dev) => self.store.remove_session(addr.with_device(dev)).await?,
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let identity_key = decode_identity_key(&resp)?;
        let user_str = addr.user_id.to_string();

        if !self.store.is_trusted_identity(&user_str, identity_key).await? {
            let decision = KeyChangeDecision::new();
            self.emit(SendEvent::KeyChange { addr, identity_key, decision: decision.clone() });
            if decision.is_accepted() && !reentrant {
                self.store.remove_identity(&user_str).await?;
                self.store.save_identity(&user_str, identity_key).await?;
                return Box::pin(self.get_keys_for_addr(addr, device_id, true)).await;
            }
            return Err(Error::IdentityKeyError { addr, identity_key: identity_key.to_vec(), accepted: decision.is_accepted() });
        }
        self.store.save_identity(&user_str, identity_key).await?;

        for device in &resp.devices {
            let bundle = decode_bundle(device, identity_key)?;
            let mut session = RatchetSession::new();
            session.init_outgoing(&bundle, &self.our_identity)?;
            save_session(self.store.as_ref(), addr.with_device(device.device_id), &session).await?;
        }
        Ok(())
    }

    /// Encrypt the padded content for one device. Untrusted-identity detection and
    /// the associated retry live in `get_keys_for_addr`, not here; by the time this
    /// is called the peer's identity is already trusted.
    async fn encrypt_for_device(&self, dev_addr: Address) -> Result<OutgoingMessageWire> {
        let mut session = load_session(self.store.as_ref(), dev_addr).await?;
        let is_first_message = session.is_first_send();

        let ciphertext = session.encrypt(&self.padded_content)?;
        let (pre_key_id, signed_pre_key_id) = session.pending_prekey_ids();
        save_session(self.store.as_ref(), dev_addr, &session).await?;

        let device_id = dev_addr.device_id.unwrap_or(1);
        let content = if is_first_message {
            let prekey_message = crate::proto::PreKeyWhisperMessage {
                registration_id: self.our_registration_id,
                pre_key_id,
                signed_pre_key_id: signed_pre_key_id
                    .ok_or_else(|| Error::SessionInitError("first send missing signed prekey id".to_string()))?,
                identity_key: self.our_identity.public_bytes(),
                message: ciphertext,
            };
            STANDARD.encode(serde_json::to_vec(&prekey_message)?)
        } else {
            STANDARD.encode(&ciphertext)
        };

        Ok(OutgoingMessageWire {
            r#type: if is_first_message { TYPE_PREKEY_BUNDLE } else { TYPE_CIPHERTEXT },
            destination_device_id: device_id,
            destination_registration_id: self.our_registration_id,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{SignalClientConfig};
    use crate::store::memory::MemoryKeyStore;

    fn test_identity() -> IdentityKeyPair {
        IdentityKeyPair::generate()
    }

    #[tokio::test]
    async fn padding_is_applied_to_content() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let signal_client = Arc::new(SignalClient::new(SignalClientConfig::new("https://example.test"), "u.1", "pw").unwrap());
        let addr = Address::new(uuid::Uuid::new_v4(), Some(1));
        let (tx, _rx) = events::channel();
        let msg = OutgoingMessage::new(store, signal_client, addr, test_identity(), 1, 0, b"hello", tx);
        assert_eq!(msg.padded_content.len() % pad::STRIDE, 0);
    }
}
