use super::*;
use crate::signal::identity::IdentityKeyPair;

#[test]
fn test_generate_batch_produces_distinct_sequential_ids() {
    let batch = PreKey::generate_batch(1, PREKEY_BATCH_SIZE);

    assert_eq!(batch.len(), PREKEY_BATCH_SIZE as usize);
    let ids: Vec<u32> = batch.iter().map(|p| p.id).collect();
    assert_eq!(ids, (1..=PREKEY_BATCH_SIZE).collect::<Vec<_>>());
}

#[test]
fn test_generate_batch_wraps_below_max_id() {
    let start = MAX_PREKEY_ID - 2;
    let batch = PreKey::generate_batch(start, 5);
    let ids: Vec<u32> = batch.iter().map(|p| p.id).collect();

    // ids must stay within [1, MAX_PREKEY_ID)
    for id in &ids {
        assert!(*id >= 1 && *id < MAX_PREKEY_ID);
    }
}

#[test]
fn test_signed_prekey_signature_verifies() {
    let identity = IdentityKeyPair::generate();
    let signed = SignedPreKey::generate(1, &identity.signing_keypair(), 1_700_000_000);

    let identity_pub = identity.signing_keypair().public_bytes();
    assert!(signed.verify_signature(&identity_pub).is_ok());
}

#[test]
fn test_signed_prekey_signature_rejects_wrong_identity() {
    let identity = IdentityKeyPair::generate();
    let other = IdentityKeyPair::generate();
    let signed = SignedPreKey::generate(1, &identity.signing_keypair(), 1_700_000_000);

    let other_pub = other.signing_keypair().public_bytes();
    assert!(signed.verify_signature(&other_pub).is_err());
}

#[test]
fn test_signed_prekey_retirement_keeps_current_and_previous() {
    assert_eq!(signed_prekey_id_to_retire(5), Some(3));
    assert_eq!(signed_prekey_id_to_retire(1), None);
    assert_eq!(signed_prekey_id_to_retire(0), None);
}
