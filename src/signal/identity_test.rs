use super::*;

#[test]
fn test_generate_produces_distinct_keys() {
    let a = IdentityKeyPair::generate();
    let b = IdentityKeyPair::generate();

    assert_ne!(a.private_bytes(), b.private_bytes());
    assert_ne!(a.public_bytes(), b.public_bytes());
}

#[test]
fn test_from_raw_bytes_roundtrips() {
    let generated = IdentityKeyPair::generate();
    let restored =
        IdentityKeyPair::from_raw_bytes(generated.private_bytes(), generated.public_bytes()).unwrap();

    assert_eq!(generated.private_bytes(), restored.private_bytes());
    assert_eq!(generated.public_bytes(), restored.public_bytes());
}

#[test]
fn test_signing_keypair_is_deterministic_from_identity() {
    let identity = IdentityKeyPair::generate();
    let signing_a = identity.signing_keypair();
    let signing_b = identity.signing_keypair();

    assert_eq!(signing_a.public_bytes(), signing_b.public_bytes());
}

#[test]
fn test_trusted_identity_equality() {
    let a = TrustedIdentity { public_key: [1u8; 32] };
    let b = TrustedIdentity { public_key: [1u8; 32] };
    let c = TrustedIdentity { public_key: [2u8; 32] };

    assert_eq!(a, b);
    assert_ne!(a, c);
}
