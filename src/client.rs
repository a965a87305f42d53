//! Authenticated HTTPS client to the relay, plus the `AtlasClient` trait
//! representing the directory/auth service this crate treats as an opaque oracle.

use crate::address::Address;
use crate::error::{Error, Result};
use crate::proto::Envelope;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Relay REST endpoint table.
pub mod paths {
    pub const ACCOUNTS: &str = "/v1/accounts";
    pub const DEVICES: &str = "/v1/devices";
    pub const KEYS: &str = "/v2/keys";
    pub const MESSAGES: &str = "/v1/messages";
    pub const ATTACHMENT: &str = "/v1/attachments";
}

#[derive(Debug, Clone)]
pub struct SignalClientConfig {
    pub server_url: String,
    pub http_timeout: Duration,
}

impl SignalClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self { server_url: server_url.into(), http_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyWire {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyWire {
    pub key_id: u32,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterKeysRequest {
    pub identity_key: String,
    pub signed_pre_key: SignedPreKeyWire,
    pub pre_keys: Vec<PreKeyWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceKeysResponse {
    pub device_id: u32,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyWire,
    pub pre_key: Option<PreKeyWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysForAddrResponse {
    pub identity_key: String,
    pub devices: Vec<DeviceKeysResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MyKeysResponse {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessageWire {
    pub r#type: i32,
    pub destination_device_id: u32,
    pub destination_registration_id: u32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagesRequest {
    pub messages: Vec<OutgoingMessageWire>,
    pub timestamp: i64,
}

/// 409 body: the server's view of our stale local device list diverges from reality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MismatchedDevices {
    pub missing_devices: Vec<u32>,
    pub extra_devices: Vec<u32>,
}

/// 410 body: sessions keyed on devices the peer has since rotated away from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleDevices {
    pub stale_devices: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentAllocation {
    pub id: String,
    pub location: String,
}

/// `GET /v1/messages` response body for the fetch-mode drain path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMessagesResponse {
    pub messages: Vec<Envelope>,
    pub more: bool,
}

/// Maps an HTTP status to the human message the messages-layer exposes.
pub fn status_message(code: u16) -> Option<&'static str> {
    match code {
        401 => Some("Invalid auth"),
        403 => Some("Invalid code"),
        404 => Some("Address not registered"),
        413 => Some("Rate limit exceeded"),
        417 => Some("Address already registered"),
        _ => None,
    }
}

/// Authenticated HTTPS client to the relay.
pub struct SignalClient {
    http: reqwest::Client,
    config: SignalClientConfig,
    username: String,
    password: String,
}

impl SignalClient {
    pub fn new(config: SignalClientConfig, username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.http_timeout).build()?;
        Ok(Self { http, config, username: username.into(), password: password.into() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server_url.trim_end_matches('/'), path)
    }

    async fn handle_response(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let code = resp.status().as_u16();
        let body = resp.text().await.ok();
        Err(Error::protocol(code as i64, body))
    }

    pub async fn register_keys(
        &self,
        identity_key: &[u8; 32],
        signed_pre_key: SignedPreKeyWire,
        pre_keys: Vec<PreKeyWire>,
    ) -> Result<()> {
        let req = RegisterKeysRequest {
            identity_key: STANDARD.encode(identity_key),
            signed_pre_key,
            pre_keys,
        };
        let resp = self
            .http
            .put(self.url(paths::KEYS))
            .basic_auth(&self.username, Some(&self.password))
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        Self::handle_response(resp).await?;
        Ok(())
    }

    pub async fn get_my_keys(&self) -> Result<u32> {
        let resp = self
            .http
            .get(self.url(paths::KEYS))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        let resp = Self::handle_response(resp).await?;
        let body: MyKeysResponse = resp.json().await?;
        Ok(body.count)
    }

    /// `deviceId = "*"` fetches keys for all of the address's devices in one call;
    /// `Some(id)` narrows to a single device.
    pub async fn get_keys_for_addr(&self, addr: &Address, device_id: Option<u32>) -> Result<KeysForAddrResponse> {
        let device_part = device_id.map(|d| d.to_string()).unwrap_or_else(|| "*".to_string());
        let path = format!("{}/{}/{}", paths::KEYS, addr.user_id, device_part);
        let resp = self
            .http
            .get(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        let resp = Self::handle_response(resp).await?;
        Ok(resp.json().await?)
    }

    pub async fn send_messages(&self, destination: &Address, messages: Vec<OutgoingMessageWire>, timestamp: i64) -> Result<()> {
        let path = format!("{}/{}", paths::MESSAGES, destination.user_id);
        let req = SendMessagesRequest { messages, timestamp };
        let resp = self
            .http
            .put(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        Self::handle_response(resp).await?;
        Ok(())
    }

    pub async fn send_message(&self, addr: &Address, device_id: u32, message: OutgoingMessageWire) -> Result<()> {
        let path = format!("{}/{}/{}", paths::MESSAGES, addr.user_id, device_id);
        let resp = self
            .http
            .put(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&message)
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        Self::handle_response(resp).await?;
        Ok(())
    }

    /// Fetch-mode alternative to the websocket: one page of queued envelopes plus
    /// whether more remain.
    pub async fn get_messages(&self) -> Result<FetchMessagesResponse> {
        let resp = self
            .http
            .get(self.url(paths::MESSAGES))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        let resp = Self::handle_response(resp).await?;
        Ok(resp.json().await?)
    }

    /// Acknowledge a fetched envelope so the relay drops it from the queue.
    pub async fn delete_message(&self, source: &str, timestamp: i64) -> Result<()> {
        let path = format!("{}/{}/{}", paths::MESSAGES, source, timestamp);
        let resp = self
            .http
            .delete(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        Self::handle_response(resp).await?;
        Ok(())
    }

    pub async fn get_attachment(&self, id: &str) -> Result<Vec<u8>> {
        let path = format!("{}/{}", paths::ATTACHMENT, id);
        let resp = self
            .http
            .get(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        let resp = Self::handle_response(resp).await?;
        let alloc: AttachmentAllocation = resp.json().await?;
        let raw = self
            .http
            .get(&alloc.location)
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        let raw = Self::handle_response(raw).await?;
        Ok(raw.bytes().await?.to_vec())
    }

    pub async fn put_attachment(&self, bytes: Vec<u8>) -> Result<String> {
        let resp = self
            .http
            .get(self.url(paths::ATTACHMENT))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        let resp = Self::handle_response(resp).await?;
        let alloc: AttachmentAllocation = resp.json().await?;
        let put = self
            .http
            .put(&alloc.location)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        Self::handle_response(put).await?;
        Ok(alloc.id)
    }

    /// If the remaining prekey count is at or below `min_level`, generate and upload
    /// `fill` fresh prekeys.
    pub async fn refresh_pre_keys_if_low(
        &self,
        min_level: u32,
        fill: u32,
        start_id: u32,
        identity_key: &[u8; 32],
        signed_pre_key: SignedPreKeyWire,
    ) -> Result<Option<Vec<crate::signal::prekey::PreKey>>> {
        let remaining = self.get_my_keys().await?;
        if remaining > min_level {
            return Ok(None);
        }
        debug!(remaining, min_level, "prekey pool low, refilling");
        let batch = crate::signal::prekey::PreKey::generate_batch(start_id, fill);
        let wire = batch
            .iter()
            .map(|k| PreKeyWire { key_id: k.id, public_key: STANDARD.encode(k.keypair.public_bytes()) })
            .collect();
        self.register_keys(identity_key, signed_pre_key, wire).await?;
        Ok(Some(batch))
    }

    /// Encrypt a `ProvisionMessage` for `recipient_pub` and PUT it to the relay's
    /// provisioning endpoint. A 404 is benign: some other device already completed
    /// the provisioning handshake.
    pub async fn link_device(
        &self,
        uuid: &str,
        recipient_pub: &[u8; 32],
        message: &crate::provisioning::ProvisionMessage,
    ) -> Result<()> {
        let envelope = crate::provisioning::ProvisioningCipher::encrypt(recipient_pub, message)?;
        let path = format!("/v1/provisioning/{}", uuid);
        let payload = serde_json::json!({
            "body": STANDARD.encode(&envelope.body),
            "ephemeralPublicKey": STANDARD.encode(envelope.public_key),
        });
        let resp = self
            .http
            .put(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            warn!("link_device got 404: someone else handled provisioning for {}", uuid);
            return Ok(());
        }
        Self::handle_response(resp).await?;
        Ok(())
    }

    pub fn get_message_websocket_url(&self) -> String {
        let base = self.config.server_url.replacen("https://", "wss://", 1).replacen("http://", "ws://", 1);
        format!("{}/v1/websocket/?login={}&password={}", base.trim_end_matches('/'), self.username, self.password)
    }

    pub fn get_provisioning_websocket_url(&self) -> String {
        let base = self.config.server_url.replacen("https://", "wss://", 1).replacen("http://", "ws://", 1);
        format!("{}/v1/websocket/provisioning/", base.trim_end_matches('/'))
    }
}

/// The directory/auth service this crate consumes as an opaque oracle: tag
/// expressions in, recipient user-id sets and JWTs out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedDistribution {
    pub userids: Vec<String>,
    pub universal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedAccount {
    pub user_id: String,
    pub device_id: u32,
    pub server_url: String,
}

#[async_trait]
pub trait AtlasClient: Send + Sync {
    async fn resolve_tags(&self, expression: &str) -> Result<ResolvedDistribution>;
    async fn issue_credential(&self) -> Result<String>;
    async fn provision_account(&self, payload: HashMap<String, serde_json::Value>) -> Result<ProvisionedAccount>;
    async fn provision_request(&self, uuid: &str, ephemeral_pub_b64: &str) -> Result<()>;
}

/// Test double for `AtlasClient`: a trivial in-process stand-in for the real
/// networked directory/auth collaborator.
pub struct StubAtlasClient {
    pub distributions: std::sync::Mutex<HashMap<String, ResolvedDistribution>>,
    pub account: ProvisionedAccount,
}

impl StubAtlasClient {
    pub fn new(account: ProvisionedAccount) -> Self {
        Self { distributions: std::sync::Mutex::new(HashMap::new()), account }
    }
}

#[async_trait]
impl AtlasClient for StubAtlasClient {
    async fn resolve_tags(&self, expression: &str) -> Result<ResolvedDistribution> {
        self.distributions
            .lock()
            .unwrap()
            .get(expression)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("no stub distribution registered for {:?}", expression)))
    }

    async fn issue_credential(&self) -> Result<String> {
        Ok("stub.jwt.credential".to_string())
    }

    async fn provision_account(&self, _payload: HashMap<String, serde_json::Value>) -> Result<ProvisionedAccount> {
        Ok(self.account.clone())
    }

    async fn provision_request(&self, _uuid: &str, _ephemeral_pub_b64: &str) -> Result<()> {
        Ok(())
    }
}
