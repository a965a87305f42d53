use crate::error::Result;
use crate::util::keys::{ECKeyPair, SigningKeyPair};

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;

/// The installation's long-lived Curve25519 identity. Exactly one per installation;
/// created at registration and never rotated except by a fresh registration, which
/// invalidates all peer trust.
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    ec_keypair: ECKeyPair,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self { ec_keypair: ECKeyPair::generate() }
    }

    pub fn from_raw_bytes(private_key: [u8; 32], public_key: [u8; 32]) -> Result<Self> {
        let ec_keypair = ECKeyPair::from_private_bytes(&private_key)?;
        debug_assert_eq!(ec_keypair.public_bytes(), public_key);
        Ok(Self { ec_keypair })
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.ec_keypair.private_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.ec_keypair.public_bytes()
    }

    pub fn ec_keypair(&self) -> &ECKeyPair {
        &self.ec_keypair
    }

    /// An Ed25519 signing key derived from the same 32 raw private bytes, used to sign
    /// signed prekeys. Not a full XEdDSA construction, just a keypair sharing seed
    /// material with the identity key.
    pub fn signing_keypair(&self) -> SigningKeyPair {
        SigningKeyPair::from_private_bytes(&self.private_bytes())
            .expect("32-byte identity key is always a valid signing seed")
    }
}

/// The last-seen long-term public key of a peer, pinned per-peer. Written on first
/// contact (implicit trust); on mismatch, all sessions for that peer are purged and a
/// keychange event is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedIdentity {
    pub public_key: [u8; 32],
}
