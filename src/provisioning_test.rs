use super::*;
use crate::util::keys::ECKeyPair;

fn sample_message(addr: &str) -> ProvisionMessage {
    ProvisionMessage {
        identity_key_private: vec![7u8; 32],
        addr: addr.to_string(),
        provisioning_code: "123456".to_string(),
        user_agent: Some("test-client".to_string()),
    }
}

#[test]
fn test_encrypt_then_decrypt_roundtrips() {
    let recipient = ECKeyPair::generate();
    let message = sample_message("11111111-1111-1111-1111-111111111111");

    let envelope = ProvisioningCipher::encrypt(&recipient.public_bytes(), &message).unwrap();
    let decrypted = ProvisioningCipher::decrypt(&recipient.private_bytes(), &envelope).unwrap();

    assert_eq!(decrypted.addr, message.addr);
    assert_eq!(decrypted.provisioning_code, message.provisioning_code);
    assert_eq!(decrypted.identity_key_private, message.identity_key_private);
}

#[test]
fn test_decrypt_with_wrong_key_fails() {
    let recipient = ECKeyPair::generate();
    let impostor = ECKeyPair::generate();
    let message = sample_message("11111111-1111-1111-1111-111111111111");

    let envelope = ProvisioningCipher::encrypt(&recipient.public_bytes(), &message).unwrap();
    assert!(ProvisioningCipher::decrypt(&impostor.private_bytes(), &envelope).is_err());
}

#[test]
fn test_decrypt_detects_corrupted_mac() {
    let recipient = ECKeyPair::generate();
    let message = sample_message("11111111-1111-1111-1111-111111111111");

    let mut envelope = ProvisioningCipher::encrypt(&recipient.public_bytes(), &message).unwrap();
    let last = envelope.body.len() - 1;
    envelope.body[last] ^= 0xFF;

    let result = ProvisioningCipher::decrypt(&recipient.private_bytes(), &envelope);
    assert!(result.is_err());
}

#[test]
fn test_decrypt_rejects_unsupported_version() {
    let recipient = ECKeyPair::generate();
    let message = sample_message("11111111-1111-1111-1111-111111111111");

    let mut envelope = ProvisioningCipher::encrypt(&recipient.public_bytes(), &message).unwrap();
    // flip the version byte, which is also covered by the MAC, so this must also fail
    envelope.body[0] = 0x02;

    let result = ProvisioningCipher::decrypt(&recipient.private_bytes(), &envelope);
    assert!(result.is_err());
}

#[test]
fn test_decrypt_and_verify_rejects_foreign_account() {
    let recipient = ECKeyPair::generate();
    let message = sample_message("11111111-1111-1111-1111-111111111111");

    let envelope = ProvisioningCipher::encrypt(&recipient.public_bytes(), &message).unwrap();
    let result = ProvisioningCipher::decrypt_and_verify(
        &recipient.private_bytes(),
        &envelope,
        "99999999-9999-9999-9999-999999999999",
    );

    assert!(result.is_err());
}

#[test]
fn test_decrypt_and_verify_accepts_matching_account() {
    let recipient = ECKeyPair::generate();
    let message = sample_message("11111111-1111-1111-1111-111111111111");

    let envelope = ProvisioningCipher::encrypt(&recipient.public_bytes(), &message).unwrap();
    let result = ProvisioningCipher::decrypt_and_verify(
        &recipient.private_bytes(),
        &envelope,
        "11111111-1111-1111-1111-111111111111",
    );

    assert!(result.is_ok());
}
