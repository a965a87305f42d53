pub mod memory;

use crate::address::Address;
use crate::error::Result;
use crate::signal::identity::{IdentityKeyPair, TrustedIdentity};
use crate::signal::prekey::PreKey;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The six namespaces the store partitions its keys into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    State,
    Session,
    PreKey,
    SignedPreKey,
    IdentityKey,
    Blocked,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::State => "state",
            Namespace::Session => "session",
            Namespace::PreKey => "prekey",
            Namespace::SignedPreKey => "signedprekey",
            Namespace::IdentityKey => "identitykey",
            Namespace::Blocked => "blocked",
        }
    }
}

/// A typed value held by the store. The store is responsible for encoding; callers
/// get typed values back rather than raw tagged buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreValue {
    Bytes(Vec<u8>),
    FixedBytes32([u8; 32]),
    Text(String),
    U32(u32),
    U64(u64),
    Bool(bool),
    Json(serde_json::Value),
}

impl StoreValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StoreValue::Bytes(b) => Some(b),
            StoreValue::FixedBytes32(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_fixed_bytes32(&self) -> Option<[u8; 32]> {
        match self {
            StoreValue::FixedBytes32(b) => Some(*b),
            StoreValue::Bytes(b) if b.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(b);
                Some(out)
            }
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoreValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            StoreValue::U32(v) => Some(*v),
            StoreValue::U64(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            StoreValue::U64(v) => Some(*v),
            StoreValue::U32(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StoreValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            StoreValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Namespaced key-value abstraction for identity, prekeys, signed prekeys, sessions,
/// per-peer trusted identities, and global client state.
///
/// `get` on a missing key returns `None`, not an error; `remove` on a missing key is a
/// no-op. Implementations must be atomic per single `set`/`remove` call; no multi-key
/// transaction support is required.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn shutdown(&self);

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<StoreValue>>;
    async fn set(&self, ns: Namespace, key: &str, value: StoreValue) -> Result<()>;
    async fn has(&self, ns: Namespace, key: &str) -> Result<bool>;
    async fn remove(&self, ns: Namespace, key: &str) -> Result<()>;

    /// All keys in `ns` whose name starts with `prefix` (or all keys, if `prefix` is
    /// `None`). Covers the common scans (`"UUID."`, `"{id}.pub"`) without requiring a
    /// full regex engine for the ordinary case.
    async fn keys(&self, ns: Namespace, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Escape hatch for callers that need a full regex scan.
    async fn keys_matching(&self, ns: Namespace, pattern: &Regex) -> Result<Vec<String>>;
}

/// Higher-level helpers layered over the raw `KeyStore` trait. Blanket-implemented so
/// every `KeyStore` gets them for free, keeping raw CRUD and the domain-specific
/// helpers callers actually use in separate layers.
#[async_trait]
pub trait KeyStoreExt: KeyStore {
    async fn get_our_identity(&self) -> Result<Option<IdentityKeyPair>> {
        let priv_key = self.get(Namespace::IdentityKey, "privKey").await?;
        let pub_key = self.get(Namespace::IdentityKey, "pubKey").await?;
        match (priv_key, pub_key) {
            (Some(priv_v), Some(pub_v)) => {
                let priv_bytes = priv_v
                    .as_fixed_bytes32()
                    .ok_or_else(|| crate::error::Error::Crypto("malformed identity private key".into()))?;
                let pub_bytes = pub_v
                    .as_fixed_bytes32()
                    .ok_or_else(|| crate::error::Error::Crypto("malformed identity public key".into()))?;
                Ok(Some(IdentityKeyPair::from_raw_bytes(priv_bytes, pub_bytes)?))
            }
            _ => Ok(None),
        }
    }

    async fn save_our_identity(&self, identity: &IdentityKeyPair) -> Result<()> {
        self.set(
            Namespace::IdentityKey,
            "privKey",
            StoreValue::FixedBytes32(identity.private_bytes()),
        )
        .await?;
        self.set(
            Namespace::IdentityKey,
            "pubKey",
            StoreValue::FixedBytes32(identity.public_bytes()),
        )
        .await
    }

    async fn load_prekey(&self, id: u32) -> Result<Option<PreKey>> {
        let priv_key = self.get(Namespace::PreKey, &format!("{}.priv", id)).await?;
        let pub_key = self.get(Namespace::PreKey, &format!("{}.pub", id)).await?;
        match (priv_key, pub_key) {
            (Some(priv_v), Some(pub_v)) => Ok(Some(PreKey::from_raw_parts(
                id,
                priv_v
                    .as_fixed_bytes32()
                    .ok_or_else(|| crate::error::Error::Crypto("malformed prekey".into()))?,
                pub_v
                    .as_fixed_bytes32()
                    .ok_or_else(|| crate::error::Error::Crypto("malformed prekey".into()))?,
            ))),
            _ => Ok(None),
        }
    }

    async fn store_prekey(&self, prekey: &PreKey) -> Result<()> {
        self.set(
            Namespace::PreKey,
            &format!("{}.priv", prekey.id),
            StoreValue::FixedBytes32(prekey.keypair.private_bytes()),
        )
        .await?;
        self.set(
            Namespace::PreKey,
            &format!("{}.pub", prekey.id),
            StoreValue::FixedBytes32(prekey.keypair.public_bytes()),
        )
        .await
    }

    /// Remove a consumed prekey; the caller is responsible for checking whether a
    /// refresh is now due (see `ClientConfig::prekey_low_water_mark`).
    async fn remove_prekey(&self, id: u32) -> Result<()> {
        self.remove(Namespace::PreKey, &format!("{}.priv", id)).await?;
        self.remove(Namespace::PreKey, &format!("{}.pub", id)).await
    }

    async fn load_signed_prekey(&self, id: u32) -> Result<Option<crate::signal::prekey::SignedPreKey>> {
        match self.get(Namespace::SignedPreKey, &id.to_string()).await? {
            Some(v) => {
                let bytes = v
                    .as_bytes()
                    .ok_or_else(|| crate::error::Error::Crypto("malformed signed prekey".into()))?;
                Ok(Some(crate::signal::prekey::SignedPreKey::from_bytes(bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn store_signed_prekey(&self, key: &crate::signal::prekey::SignedPreKey) -> Result<()> {
        self.set(Namespace::SignedPreKey, &key.id.to_string(), StoreValue::Bytes(key.to_bytes()))
            .await
    }

    /// Per the rotation rule: keeps `current` and `current-1` live to bridge
    /// concurrent initiations, so the caller deletes only `current-2`.
    async fn remove_signed_prekey(&self, id: u32) -> Result<()> {
        self.remove(Namespace::SignedPreKey, &id.to_string()).await
    }

    async fn load_session(&self, addr: Address) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get(Namespace::Session, &addr.to_string())
            .await?
            .and_then(|v| v.as_bytes().map(|b| b.to_vec())))
    }

    async fn store_session(&self, addr: Address, session: Vec<u8>) -> Result<()> {
        self.set(Namespace::Session, &addr.to_string(), StoreValue::Bytes(session))
            .await
    }

    async fn remove_session(&self, addr: Address) -> Result<()> {
        self.remove(Namespace::Session, &addr.to_string()).await
    }

    /// Remove every session for every device of `addr.user_id` (prefix scan).
    async fn remove_all_sessions(&self, user_prefix: &str) -> Result<()> {
        let prefix = format!("{}.", user_prefix);
        for key in self.keys(Namespace::Session, Some(&prefix)).await? {
            self.remove(Namespace::Session, &key).await?;
        }
        // the bare-uuid form (no device suffix) is also a valid session key
        if self.has(Namespace::Session, user_prefix).await? {
            self.remove(Namespace::Session, user_prefix).await?;
        }
        Ok(())
    }

    async fn clear_session_store(&self) -> Result<()> {
        for key in self.keys(Namespace::Session, None).await? {
            self.remove(Namespace::Session, &key).await?;
        }
        Ok(())
    }

    async fn load_identity(&self, user_id: &str) -> Result<Option<TrustedIdentity>> {
        Ok(self
            .get(Namespace::IdentityKey, user_id)
            .await?
            .and_then(|v| v.as_fixed_bytes32())
            .map(|pub_key| TrustedIdentity { public_key: pub_key }))
    }

    /// If a prior trusted key exists and differs from the new one, purge all sessions for
    /// this peer before overwriting it.
    async fn save_identity(&self, user_id: &str, public_key: [u8; 32]) -> Result<bool> {
        let prior = self.load_identity(user_id).await?;
        let changed = match &prior {
            Some(existing) => existing.public_key != public_key,
            None => false,
        };
        if changed {
            self.remove_all_sessions(user_id).await?;
        }
        self.set(Namespace::IdentityKey, user_id, StoreValue::FixedBytes32(public_key))
            .await?;
        Ok(changed)
    }

    async fn is_trusted_identity(&self, user_id: &str, public_key: [u8; 32]) -> Result<bool> {
        match self.load_identity(user_id).await? {
            Some(existing) => Ok(existing.public_key == public_key),
            // first contact: implicit trust (caller logs this at warn!)
            None => Ok(true),
        }
    }

    async fn remove_identity(&self, user_id: &str) -> Result<()> {
        self.remove(Namespace::IdentityKey, user_id).await
    }

    /// Device ids with a live session for `user_id`, derived from a session-key scan.
    async fn get_device_ids(&self, user_id: &str) -> Result<Vec<u32>> {
        let prefix = format!("{}.", user_id);
        let mut ids = Vec::new();
        for key in self.keys(Namespace::Session, Some(&prefix)).await? {
            if let Some(suffix) = key.strip_prefix(&prefix) {
                if let Ok(id) = suffix.parse::<u32>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

impl<T: KeyStore + ?Sized> KeyStoreExt for T {}

/// Well-known keys in the `state` namespace (the persisted account state bag).
pub mod state_keys {
    pub const ADDR: &str = "addr";
    pub const DEVICE_ID: &str = "deviceId";
    pub const SERVER_URL: &str = "serverUrl";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const SIGNALING_KEY: &str = "signalingKey";
    pub const REGISTRATION_ID: &str = "registrationId";
    pub const MAX_PREKEY_ID: &str = "maxPreKeyId";
    pub const SIGNED_KEY_ID: &str = "signedKeyId";
    pub const ATLAS_CREDENTIAL: &str = "atlasCredential";
    pub const ATLAS_URL: &str = "atlasUrl";
}

/// Typed helpers over the `state` namespace. Split from `KeyStoreExt` only because
/// the state bag has its own invariant ("registrationId set iff identity set iff
/// addr set") that the higher-level registration flow is responsible for upholding.
#[async_trait]
pub trait StateStoreExt: KeyStore {
    async fn get_state_text(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(Namespace::State, key).await?.and_then(|v| v.as_text().map(str::to_string)))
    }

    async fn set_state_text(&self, key: &str, value: impl Into<String> + Send) -> Result<()> {
        self.set(Namespace::State, key, StoreValue::Text(value.into())).await
    }

    async fn get_state_u32(&self, key: &str) -> Result<Option<u32>> {
        Ok(self.get(Namespace::State, key).await?.and_then(|v| v.as_u32()))
    }

    async fn set_state_u32(&self, key: &str, value: u32) -> Result<()> {
        self.set(Namespace::State, key, StoreValue::U32(value)).await
    }

    async fn get_state_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(Namespace::State, key).await?.and_then(|v| v.as_bytes().map(|b| b.to_vec())))
    }

    async fn set_state_bytes(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.set(Namespace::State, key, StoreValue::Bytes(value)).await
    }

    /// Is this installation registered? Per invariant: `registrationId` is set iff
    /// identity is set iff `addr` is set, so any one of them is a reliable probe.
    async fn is_registered(&self) -> Result<bool> {
        Ok(self.has(Namespace::State, state_keys::ADDR).await?)
    }
}

impl<T: KeyStore + ?Sized> StateStoreExt for T {}
