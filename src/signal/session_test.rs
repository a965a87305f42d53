use super::*;
use crate::signal::identity::IdentityKeyPair;
use crate::signal::prekey::SignedPreKey;

struct Peer {
    identity: IdentityKeyPair,
    signed_prekey: SignedPreKey,
    one_time_prekey: ECKeyPair,
}

impl Peer {
    fn new() -> Self {
        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(1, &identity.signing_keypair(), 1_700_000_000);
        let one_time_prekey = ECKeyPair::generate();
        Self { identity, signed_prekey, one_time_prekey }
    }

    fn bundle(&self, device_id: u32) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: 1234,
            device_id,
            pre_key_id: Some(1),
            pre_key_public: Some(self.one_time_prekey.public_bytes()),
            signed_pre_key_id: self.signed_prekey.id,
            signed_pre_key_public: self.signed_prekey.keypair.public_bytes(),
            signed_pre_key_signature: self.signed_prekey.signature,
            identity_key: self.identity.public_bytes(),
        }
    }
}

fn bootstrap_pair() -> (RatchetSession, RatchetSession, Peer, Peer) {
    let alice = Peer::new();
    let bob = Peer::new();

    let mut alice_session = RatchetSession::new();
    alice_session.init_outgoing(&bob.bundle(1), &alice.identity).unwrap();

    let mut bob_session = RatchetSession::new();
    bob_session
        .init_incoming(
            alice.identity.public_bytes(),
            alice_session.dh_self_public,
            &bob.identity,
            &bob.signed_prekey.keypair,
            Some(&bob.one_time_prekey),
        )
        .unwrap();

    (alice_session, bob_session, alice, bob)
}

#[test]
fn test_first_message_roundtrips() {
    let (mut alice, mut bob, _, _) = bootstrap_pair();

    let ciphertext = alice.encrypt(b"hello bob").unwrap();
    let plaintext = bob.decrypt(&ciphertext).unwrap();

    assert_eq!(plaintext, b"hello bob");
}

#[test]
fn test_multiple_messages_in_order() {
    let (mut alice, mut bob, _, _) = bootstrap_pair();

    for i in 0..5 {
        let msg = format!("message {}", i);
        let ciphertext = alice.encrypt(msg.as_bytes()).unwrap();
        let plaintext = bob.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, msg.as_bytes());
    }
}

#[test]
fn test_out_of_order_message_uses_skipped_key() {
    let (mut alice, mut bob, _, _) = bootstrap_pair();

    let first = alice.encrypt(b"first").unwrap();
    let second = alice.encrypt(b"second").unwrap();

    // deliver second before first; bob must derive and cache the skipped key for `first`
    assert_eq!(bob.decrypt(&second).unwrap(), b"second");
    assert_eq!(bob.decrypt(&first).unwrap(), b"first");
}

#[test]
fn test_replayed_message_is_a_counter_error() {
    let (mut alice, mut bob, _, _) = bootstrap_pair();

    let ciphertext = alice.encrypt(b"once only").unwrap();
    bob.decrypt(&ciphertext).unwrap();

    let replay = bob.decrypt(&ciphertext);
    assert!(matches!(replay, Err(Error::MessageCounterError(_))));
}

#[test]
fn test_has_open_session_and_close() {
    let (mut alice, _, _, _) = bootstrap_pair();
    assert!(alice.has_open_session());

    alice.close_open_session();
    assert!(!alice.has_open_session());
}

#[test]
fn test_encrypt_without_open_session_fails() {
    let mut session = RatchetSession::new();
    assert!(session.encrypt(b"nope").is_err());
}
