use crate::error::{Error, Result};
use crate::util::crypto::{aes_cbc_decrypt, aes_cbc_encrypt, constant_time_eq, hkdf_expand_with_salt, hmac_sha256, random_bytes};
use crate::util::keys::ECKeyPair;

#[cfg(test)]
#[path = "provisioning_test.rs"]
mod tests;

const PROVISIONING_INFO: &[u8] = b"TextSecure Provisioning Message";
const PROVISIONING_VERSION: u8 = 0x01;

/// Wire message exchanged with the relay's provisioning endpoint: an ephemeral public
/// key plus the encrypted envelope body.
#[derive(Debug, Clone)]
pub struct ProvisionEnvelope {
    pub public_key: [u8; 32],
    pub body: Vec<u8>,
}

/// The payload transported inside a `ProvisionEnvelope`: the primary's identity
/// private key plus enough metadata for the secondary device to complete registration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProvisionMessage {
    pub identity_key_private: Vec<u8>,
    pub addr: String,
    pub provisioning_code: String,
    pub user_agent: Option<String>,
}

/// Bootstraps a secondary device by transporting the primary's identity key pair over
/// an ECDH + HKDF + AES-256-CBC + HMAC-SHA256 envelope.
pub struct ProvisioningCipher;

impl ProvisioningCipher {
    /// Encrypt `message` for `recipient_public`, generating a fresh ephemeral keypair.
    pub fn encrypt(recipient_public: &[u8; 32], message: &ProvisionMessage) -> Result<ProvisionEnvelope> {
        let ephemeral = ECKeyPair::generate();
        let shared_secret = ephemeral.ecdh(recipient_public);

        let derived = hkdf_expand_with_salt(&shared_secret, &[0u8; 32], PROVISIONING_INFO, 64)?;
        let (cipher_key, mac_key) = derived.split_at(32);

        let plaintext = serde_json::to_vec(message)?;
        let iv_bytes = random_bytes(16);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&iv_bytes);

        let ciphertext = aes_cbc_encrypt(cipher_key, &iv, &plaintext)?;

        let mut mac_input = Vec::with_capacity(1 + 16 + ciphertext.len());
        mac_input.push(PROVISIONING_VERSION);
        mac_input.extend_from_slice(&iv);
        mac_input.extend_from_slice(&ciphertext);
        let mac = hmac_sha256(mac_key, &mac_input, 32)?;

        let mut body = mac_input;
        body.extend_from_slice(&mac);

        Ok(ProvisionEnvelope { public_key: ephemeral.public_bytes(), body })
    }

    /// Decrypt an envelope using our own Curve25519 private key. Fails if the version
    /// byte isn't 1 or the MAC doesn't verify.
    pub fn decrypt(our_private_key: &[u8; 32], envelope: &ProvisionEnvelope) -> Result<ProvisionMessage> {
        if envelope.body.len() < 1 + 16 + 32 {
            return Err(Error::Crypto("provisioning envelope too short".to_string()));
        }

        let keypair = ECKeyPair::from_private_bytes(our_private_key)?;
        let shared_secret = keypair.ecdh(&envelope.public_key);
        let derived = hkdf_expand_with_salt(&shared_secret, &[0u8; 32], PROVISIONING_INFO, 64)?;
        let (cipher_key, mac_key) = derived.split_at(32);

        let body = &envelope.body;
        let mac_offset = body.len() - 32;
        let (mac_input, mac) = body.split_at(mac_offset);

        let expected_mac = hmac_sha256(mac_key, mac_input, 32)?;
        if !constant_time_eq(&expected_mac, mac) {
            return Err(Error::Crypto("provisioning envelope MAC mismatch".to_string()));
        }

        let version = mac_input[0];
        if version != PROVISIONING_VERSION {
            return Err(Error::Crypto(format!("unsupported provisioning envelope version {}", version)));
        }

        let iv = &mac_input[1..17];
        let ciphertext = &mac_input[17..];
        let plaintext = aes_cbc_decrypt(cipher_key, iv, ciphertext)?;

        serde_json::from_slice(&plaintext).map_err(Error::from)
    }

    /// Decrypt and additionally verify that the embedded address matches the account
    /// UUID fetched from Atlas. Rejects foreign provisioning attempts.
    pub fn decrypt_and_verify(
        our_private_key: &[u8; 32],
        envelope: &ProvisionEnvelope,
        expected_account_uuid: &str,
    ) -> Result<ProvisionMessage> {
        let message = Self::decrypt(our_private_key, envelope)?;
        if message.addr != expected_account_uuid {
            return Err(Error::Auth(
                "foreign account sent us an identity key".to_string(),
            ));
        }
        Ok(message)
    }
}
