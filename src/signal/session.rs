use crate::error::{Error, Result};
use crate::signal::identity::IdentityKeyPair;
use crate::signal::prekey::PreKeyBundle;
use crate::util::crypto::{aes_cbc_decrypt, aes_cbc_encrypt, constant_time_eq, hkdf_expand, hmac_sha256, random_bytes};
use crate::util::keys::ECKeyPair;
use std::collections::HashMap;

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

const ROOT_INFO: &[u8] = b"WhisperText";
const CHAIN_INFO: &[u8] = b"WhisperRatchet";
const MESSAGE_KEY_INFO: &[u8] = b"WhisperMessageKeys";
const MAX_SKIP: u32 = 1000;

/// The externally-consumed Double Ratchet surface. This crate treats the ratchet as a
/// library it drives, not a component it owns: one thin concrete implementation is
/// provided so the rest of the pipeline (OutgoingMessage, MessageReceiver) is testable
/// end-to-end, per the "consumed as a library" note.
pub trait SessionCipher: Send + Sync {
    fn has_open_session(&self) -> bool;
    fn close_open_session(&mut self);
    fn init_outgoing(&mut self, bundle: &PreKeyBundle, our_identity: &IdentityKeyPair) -> Result<()>;
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Serialized, opaque-to-callers session state for one `(peer_user_id, peer_device_id)`
/// pair.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RatchetSession {
    dh_self_private: [u8; 32],
    dh_self_public: [u8; 32],
    dh_remote: Option<[u8; 32]>,
    root_key: [u8; 32],
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    sending_counter: u32,
    receiving_counter: u32,
    #[serde(skip)]
    skipped_keys: HashMap<([u8; 32], u32), [u8; 32]>,
    open: bool,
    /// The one-time/signed prekey ids consumed by `init_outgoing`, carried so the
    /// first outgoing message can be wire-tagged as a prekey bundle. Stale after the
    /// first send; callers gate on `is_first_send()`, not on these being `Some`.
    #[serde(default)]
    pending_pre_key_id: Option<u32>,
    #[serde(default)]
    pending_signed_pre_key_id: Option<u32>,
}

impl RatchetSession {
    pub fn new() -> Self {
        let dh_self = ECKeyPair::generate();
        Self {
            dh_self_private: dh_self.private_bytes(),
            dh_self_public: dh_self.public_bytes(),
            dh_remote: None,
            root_key: [0u8; 32],
            sending_chain_key: None,
            receiving_chain_key: None,
            sending_counter: 0,
            receiving_counter: 0,
            skipped_keys: HashMap::new(),
            open: false,
            pending_pre_key_id: None,
            pending_signed_pre_key_id: None,
        }
    }

    /// True until the first message has been encrypted on this session, i.e. while
    /// the sender still needs to tag its wire message as a prekey bundle.
    pub fn is_first_send(&self) -> bool {
        self.sending_counter == 0
    }

    /// The one-time/signed prekey ids `init_outgoing` consumed to establish this
    /// session, for tagging the first outgoing wire message.
    pub fn pending_prekey_ids(&self) -> (Option<u32>, Option<u32>) {
        (self.pending_pre_key_id, self.pending_signed_pre_key_id)
    }

    fn dh_self(&self) -> ECKeyPair {
        ECKeyPair::from_private_bytes(&self.dh_self_private)
            .expect("stored session private key is always 32 bytes")
    }

    fn kdf_root(&self, dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
        let combined = [self.root_key.as_slice(), dh_output.as_slice()].concat();
        let out = hkdf_expand(&combined, ROOT_INFO, 64)?;
        let mut new_root = [0u8; 32];
        let mut new_chain = [0u8; 32];
        new_root.copy_from_slice(&out[..32]);
        new_chain.copy_from_slice(&out[32..]);
        Ok((new_root, new_chain))
    }

    fn kdf_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
        let next_chain = hmac_sha256(chain_key, CHAIN_INFO, 32)?;
        let message_key = hmac_sha256(chain_key, MESSAGE_KEY_INFO, 32)?;
        let mut next = [0u8; 32];
        let mut msg = [0u8; 32];
        next.copy_from_slice(&next_chain);
        msg.copy_from_slice(&message_key);
        Ok((next, msg))
    }

    /// Derive a new receiving chain from the current `dh_self` against `remote_public`,
    /// without rotating `dh_self`.
    fn recv_step(&mut self, remote_public: [u8; 32]) -> Result<()> {
        let output = self.dh_self().ecdh(&remote_public);
        let (new_root, chain) = self.kdf_root(&output)?;
        self.root_key = new_root;
        self.receiving_chain_key = Some(chain);
        self.receiving_counter = 0;
        Ok(())
    }

    /// Derive a new sending chain from the current `dh_self` against `remote_public`,
    /// without rotating `dh_self`.
    fn send_step(&mut self, remote_public: [u8; 32]) -> Result<()> {
        let output = self.dh_self().ecdh(&remote_public);
        let (new_root, chain) = self.kdf_root(&output)?;
        self.root_key = new_root;
        self.sending_chain_key = Some(chain);
        self.sending_counter = 0;
        self.dh_remote = Some(remote_public);
        Ok(())
    }

    /// Full DH ratchet turn on receipt of a new remote ratchet key: derive the
    /// receiving chain from the *old* `dh_self`, then generate a fresh `dh_self` and
    /// derive the sending chain from that against the same remote key.
    fn dh_ratchet_step(&mut self, remote_public: [u8; 32]) -> Result<()> {
        self.recv_step(remote_public)?;

        let new_self = ECKeyPair::generate();
        self.dh_self_private = new_self.private_bytes();
        self.dh_self_public = new_self.public_bytes();
        self.send_step(remote_public)
    }
}

impl RatchetSession {
    /// Responder-side session bootstrap from an X3DH-style prekey message: the sender's
    /// long-term identity key and ephemeral ("base") key, plus our own signed prekey
    /// (reused as the first ratchet key) and the one-time prekey the sender consumed,
    /// if any. Not part of `SessionCipher` since the responder needs access to local
    /// key material the generic interface doesn't carry.
    pub fn init_incoming(
        &mut self,
        sender_identity_public: [u8; 32],
        sender_ephemeral_public: [u8; 32],
        our_identity: &IdentityKeyPair,
        our_signed_prekey: &ECKeyPair,
        our_one_time_prekey: Option<&ECKeyPair>,
    ) -> Result<()> {
        let dh1 = our_signed_prekey.ecdh(&sender_identity_public);
        let dh2 = our_identity.ec_keypair().ecdh(&sender_ephemeral_public);
        let dh3 = our_signed_prekey.ecdh(&sender_ephemeral_public);
        let mut master = Vec::with_capacity(128);
        master.extend_from_slice(&dh1);
        master.extend_from_slice(&dh2);
        master.extend_from_slice(&dh3);
        if let Some(one_time) = our_one_time_prekey {
            master.extend_from_slice(&one_time.ecdh(&sender_ephemeral_public));
        }

        let derived = hkdf_expand(&master, ROOT_INFO, 32)?;
        self.root_key.copy_from_slice(&derived);
        self.dh_self_private = our_signed_prekey.private_bytes();
        self.dh_self_public = our_signed_prekey.public_bytes();
        self.dh_remote = None;
        self.open = true;
        Ok(())
    }
}

impl Default for RatchetSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCipher for RatchetSession {
    fn has_open_session(&self) -> bool {
        self.open
    }

    fn close_open_session(&mut self) {
        *self = RatchetSession::new();
    }

    fn init_outgoing(&mut self, bundle: &PreKeyBundle, our_identity: &IdentityKeyPair) -> Result<()> {
        let ephemeral = ECKeyPair::generate();

        let dh1 = our_identity.ec_keypair().ecdh(&bundle.signed_pre_key_public);
        let dh2 = ephemeral.ecdh(&bundle.identity_key);
        let dh3 = ephemeral.ecdh(&bundle.signed_pre_key_public);
        let mut master = Vec::with_capacity(128);
        master.extend_from_slice(&dh1);
        master.extend_from_slice(&dh2);
        master.extend_from_slice(&dh3);
        if let Some(pre_key_public) = bundle.pre_key_public {
            master.extend_from_slice(&ephemeral.ecdh(&pre_key_public));
        }

        let derived = hkdf_expand(&master, ROOT_INFO, 32)?;
        self.root_key.copy_from_slice(&derived);
        self.dh_self_private = ephemeral.private_bytes();
        self.dh_self_public = ephemeral.public_bytes();
        self.open = true;
        self.pending_pre_key_id = bundle.pre_key_id;
        self.pending_signed_pre_key_id = Some(bundle.signed_pre_key_id);

        // the initiator has already "spent" its ratchet key as the X3DH ephemeral; it
        // derives a sending chain directly and waits to ratchet until it sees the
        // responder's first reply carry a new remote key.
        self.send_step(bundle.signed_pre_key_public)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if !self.open {
            return Err(Error::SessionError("no open session".to_string()));
        }
        let chain_key = self
            .sending_chain_key
            .ok_or_else(|| Error::SessionError("sending chain not established".to_string()))?;
        let (next_chain, message_key) = Self::kdf_chain(&chain_key)?;

        let iv_bytes = random_bytes(16);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&iv_bytes);
        let ciphertext = aes_cbc_encrypt(&message_key, &iv, plaintext)?;

        let mut frame = Vec::with_capacity(1 + 4 + 32 + 16 + ciphertext.len());
        frame.push(1u8);
        frame.extend_from_slice(&self.sending_counter.to_be_bytes());
        frame.extend_from_slice(&self.dh_self_public);
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&ciphertext);

        self.sending_chain_key = Some(next_chain);
        self.sending_counter += 1;
        Ok(frame)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 1 + 4 + 32 + 16 {
            return Err(Error::SessionError("truncated ratchet frame".to_string()));
        }
        if ciphertext[0] != 1 {
            return Err(Error::SessionError(format!("unknown ratchet frame version {}", ciphertext[0])));
        }
        let mut counter_bytes = [0u8; 4];
        counter_bytes.copy_from_slice(&ciphertext[1..5]);
        let counter = u32::from_be_bytes(counter_bytes);

        let mut sender_dh = [0u8; 32];
        sender_dh.copy_from_slice(&ciphertext[5..37]);
        let iv = &ciphertext[37..53];
        let body = &ciphertext[53..];

        if let Some(message_key) = self.skipped_keys.remove(&(sender_dh, counter)) {
            return aes_cbc_decrypt(&message_key, iv, body);
        }

        if self.dh_remote != Some(sender_dh) {
            self.dh_ratchet_step(sender_dh)?;
        }

        if counter < self.receiving_counter {
            return Err(Error::MessageCounterError(format!(
                "message counter {} already consumed (at {})",
                counter, self.receiving_counter
            )));
        }

        let skip_count = counter - self.receiving_counter;
        if skip_count > MAX_SKIP {
            return Err(Error::SessionError(format!("too many skipped messages: {}", skip_count)));
        }

        let mut chain_key = self
            .receiving_chain_key
            .ok_or_else(|| Error::SessionError("receiving chain not established".to_string()))?;

        for skipped in self.receiving_counter..counter {
            let (next_chain, message_key) = Self::kdf_chain(&chain_key)?;
            self.skipped_keys.insert((sender_dh, skipped), message_key);
            chain_key = next_chain;
        }

        let (next_chain, message_key) = Self::kdf_chain(&chain_key)?;
        self.receiving_chain_key = Some(next_chain);
        self.receiving_counter = counter + 1;

        let plaintext = aes_cbc_decrypt(&message_key, iv, body)?;
        self.open = true;
        Ok(plaintext)
    }
}

/// Constant-time equality check exposed for callers verifying MACs alongside a
/// session, e.g. the provisioning cipher.
pub fn verify_mac(expected: &[u8], actual: &[u8]) -> bool {
    constant_time_eq(expected, actual)
}

/// Parse the sender's ratchet ("base") public key out of a wire frame produced by
/// `SessionCipher::encrypt`, without needing an established session. Used by a
/// responder to bootstrap via `init_incoming` before any session exists.
pub fn frame_sender_public(frame: &[u8]) -> Result<[u8; 32]> {
    if frame.len() < 1 + 4 + 32 + 16 {
        return Err(Error::SessionError("truncated ratchet frame".to_string()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&frame[5..37]);
    Ok(out)
}
