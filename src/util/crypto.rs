use crate::error::{Error, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use ring::digest;
use sha2::Sha256;

#[cfg(test)]
#[path = "crypto_test.rs"]
mod tests;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 expansion, used to split a shared secret into cipher/mac keys.
pub fn hkdf_expand(key: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(None, key);
    let mut output = vec![0u8; length];
    hk.expand(info, &mut output)
        .map_err(|e| Error::Crypto(format!("HKDF expansion failed: {}", e)))?;
    Ok(output)
}

/// HKDF-SHA256 expansion with an explicit salt (used by the double-ratchet root chain).
pub fn hkdf_expand_with_salt(key: &[u8], salt: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), key);
    let mut output = vec![0u8; length];
    hk.expand(info, &mut output)
        .map_err(|e| Error::Crypto(format!("HKDF expansion failed: {}", e)))?;
    Ok(output)
}

/// SHA-256 hash
pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

/// Generate random bytes
pub fn random_bytes(length: usize) -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};

    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; length];
    rng.fill(&mut bytes).unwrap();
    bytes
}

/// AES-256-CBC encryption with PKCS#7 padding. `key` must be 32 bytes, `iv` 16 bytes.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let encryptor = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("invalid AES-CBC key/iv: {}", e)))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// AES-256-CBC decryption with PKCS#7 padding.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("invalid AES-CBC key/iv: {}", e)))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Crypto("AES-CBC padding invalid".to_string()))
}

/// HMAC-SHA256 over arbitrary data, truncated to `out_len` bytes (<= 32).
pub fn hmac_sha256(mac_key: &[u8], data: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| Error::Crypto(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    let full = mac.finalize().into_bytes();
    Ok(full[..out_len.min(32)].to_vec())
}

/// Constant-time comparison, used for MAC verification.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Pad a plaintext to the next multiple of `stride` bytes: append `0x80` then zero-fill.
///
/// Used to hide the length of outgoing message content within fixed-size buckets.
pub fn pad_message(plaintext: &[u8], stride: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(plaintext.len() + stride);
    out.extend_from_slice(plaintext);
    out.push(0x80);
    let remainder = out.len() % stride;
    if remainder != 0 {
        out.extend(std::iter::repeat(0u8).take(stride - remainder));
    }
    out
}

/// Reverse of [`pad_message`]: scan from the tail for the `0x80` marker, truncate there.
///
/// An all-zero buffer, or a buffer with trailing bytes other than `0x00` before the
/// marker, is invalid padding.
pub fn unpad_message(padded: &[u8]) -> Result<Vec<u8>> {
    for (i, &byte) in padded.iter().enumerate().rev() {
        if byte == 0x80 {
            return Ok(padded[..i].to_vec());
        }
        if byte != 0x00 {
            return Err(Error::Protocol("invalid message padding".to_string()));
        }
    }
    Err(Error::Protocol("invalid message padding".to_string()))
}
