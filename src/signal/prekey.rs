use crate::error::{Error, Result};
use crate::util::keys::{ECKeyPair, SigningKeyPair};

#[cfg(test)]
#[path = "prekey_test.rs"]
mod tests;

/// Upper bound (exclusive) on prekey/signed-prekey ids: `[1, 2^24)`.
pub const MAX_PREKEY_ID: u32 = 1 << 24;

/// Number of prekeys generated per refill batch.
pub const PREKEY_BATCH_SIZE: u32 = 100;

/// A one-time Curve25519 keypair, consumed by a peer one-at-a-time when initiating a
/// session.
#[derive(Debug, Clone)]
pub struct PreKey {
    pub id: u32,
    pub keypair: ECKeyPair,
}

impl PreKey {
    pub fn generate(id: u32) -> Self {
        Self { id, keypair: ECKeyPair::generate() }
    }

    pub fn from_raw_parts(id: u32, private_key: [u8; 32], public_key: [u8; 32]) -> Self {
        let keypair = ECKeyPair::from_private_bytes(&private_key)
            .expect("prekey private key is always 32 bytes");
        debug_assert_eq!(keypair.public_bytes(), public_key);
        Self { id, keypair }
    }

    /// Generate a full refill batch starting at `start_id` (inclusive), wrapping the
    /// id space back below `MAX_PREKEY_ID` if necessary.
    pub fn generate_batch(start_id: u32, count: u32) -> Vec<PreKey> {
        (0..count)
            .map(|offset| {
                let id = ((start_id.max(1) - 1 + offset) % (MAX_PREKEY_ID - 1)) + 1;
                PreKey::generate(id)
            })
            .collect()
    }
}

/// A periodically-rotated Curve25519 keypair, signed by the installation's identity.
#[derive(Debug, Clone)]
pub struct SignedPreKey {
    pub id: u32,
    pub keypair: ECKeyPair,
    pub signature: [u8; 64],
    pub timestamp: u64,
}

impl SignedPreKey {
    /// Generate and sign a new signed prekey with identity's derived signing key.
    pub fn generate(id: u32, identity_signing_key: &SigningKeyPair, timestamp: u64) -> Self {
        use ed25519_dalek::Signer;

        let keypair = ECKeyPair::generate();
        let signature = identity_signing_key.signing_key().sign(&keypair.public_bytes()).to_bytes();
        Self { id, keypair, signature, timestamp }
    }

    pub fn verify_signature(&self, identity_public_key: &[u8; 32]) -> Result<()> {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let verifying_key = VerifyingKey::from_bytes(identity_public_key)
            .map_err(|e| Error::Crypto(format!("invalid identity public key: {}", e)))?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(&self.keypair.public_bytes(), &signature)
            .map_err(|_| Error::PreKeyError("signed prekey signature verification failed".into()))
    }

    /// Flat `id || priv || pub || signature || timestamp` encoding for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 + 32 + 64 + 8);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.keypair.private_bytes());
        out.extend_from_slice(&self.keypair.public_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 4 + 32 + 32 + 64 + 8 {
            return Err(Error::PreKeyError("malformed stored signed prekey".to_string()));
        }
        let id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let private_key: [u8; 32] = bytes[4..36].try_into().unwrap();
        let public_key: [u8; 32] = bytes[36..68].try_into().unwrap();
        let signature: [u8; 64] = bytes[68..132].try_into().unwrap();
        let timestamp = u64::from_be_bytes(bytes[132..140].try_into().unwrap());
        let keypair = ECKeyPair::from_private_bytes(&private_key)?;
        debug_assert_eq!(keypair.public_bytes(), public_key);
        Ok(Self { id, keypair, signature, timestamp })
    }
}

/// The set of public material a peer fetches to initiate a session with one device.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    pub pre_key_id: Option<u32>,
    pub pre_key_public: Option<[u8; 32]>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub identity_key: [u8; 32],
}

/// Given the current `signedKeyId` counter, compute which older signed prekey id (if
/// any) is now eligible for deletion: rotation keeps `current` and `current-1` live to
/// bridge concurrent initiations, deleting `current-2`.
pub fn signed_prekey_id_to_retire(current_signed_key_id: u32) -> Option<u32> {
    current_signed_key_id.checked_sub(2)
}
