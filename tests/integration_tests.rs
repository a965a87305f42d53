use signal_client::address::Address;
use signal_client::client::{ProvisionedAccount, ResolvedDistribution, StubAtlasClient};
use signal_client::config::ClientConfig;
use signal_client::payload::{BodyItem, Distribution, Payload, PayloadData, PayloadV1, Sender};
use signal_client::provisioning::{ProvisionMessage, ProvisioningCipher};
use signal_client::registration::register_account;
use signal_client::signal::identity::IdentityKeyPair;
use signal_client::signal::prekey::PreKeyBundle;
use signal_client::signal::session::{RatchetSession, SessionCipher};
use signal_client::store::memory::MemoryKeyStore;
use signal_client::store::{KeyStoreExt, StateStoreExt};
use signal_client::tag::parse_tag;
use signal_client::util::keys::ECKeyPair;
use uuid::Uuid;

fn stub_atlas(user_id: Uuid, device_id: u32, server_url: &str) -> StubAtlasClient {
    StubAtlasClient::new(ProvisionedAccount {
        user_id: user_id.to_string(),
        device_id,
        server_url: server_url.to_string(),
    })
}

#[tokio::test]
async fn register_account_persists_identity_and_state() {
    let store = MemoryKeyStore::new();
    let user_id = Uuid::new_v4();
    let atlas = stub_atlas(user_id, 1, "https://relay.example.test");
    let config = ClientConfig::default();

    let registered = register_account(&store, &atlas, "test device", &config).await.unwrap();

    assert_eq!(registered.addr.user_id, user_id);
    assert_eq!(registered.addr.device_id, Some(1));
    assert_eq!(registered.server_url, "https://relay.example.test");

    assert!(store.is_registered().await.unwrap());
    let identity = store.get_our_identity().await.unwrap();
    assert!(identity.is_some());

    let stored_username = store.get_state_text(signal_client::store::state_keys::USERNAME).await.unwrap();
    assert_eq!(stored_username.as_deref(), Some(registered.addr.to_string().as_str()));

    // a full prekey batch plus a signed prekey should have been registered.
    let max_id = store.get_state_u32(signal_client::store::state_keys::MAX_PREKEY_ID).await.unwrap();
    assert_eq!(max_id, Some(signal_client::signal::prekey::PREKEY_BATCH_SIZE + 1));
}

#[tokio::test]
async fn register_account_clears_prior_sessions_on_reregistration() {
    let store = MemoryKeyStore::new();
    let user_id = Uuid::new_v4();
    let atlas = stub_atlas(user_id, 1, "https://relay.example.test");
    let config = ClientConfig::default();

    // simulate a leftover session from a previous installation.
    let stale_addr = Address::new(Uuid::new_v4(), Some(1));
    store.store_session(stale_addr, vec![1, 2, 3]).await.unwrap();

    register_account(&store, &atlas, "test device", &config).await.unwrap();

    assert!(store.load_session(stale_addr).await.unwrap().is_none());
}

/// `init_outgoing` consumes the ephemeral key as `dh_self`; recovering it here lets
/// the test drive `init_incoming` the way a receiving peer would after parsing the
/// ratchet frame's embedded sender key, without exposing a test-only accessor on
/// `RatchetSession` itself.
fn alice_session_ephemeral_public(session: &RatchetSession) -> [u8; 32] {
    let serialized = serde_json::to_value(session).unwrap();
    let values = serialized["dh_self_public"].as_array().unwrap();
    let mut out = [0u8; 32];
    for (i, v) in values.iter().enumerate() {
        out[i] = v.as_u64().unwrap() as u8;
    }
    out
}

#[test]
fn ratchet_session_round_trips_a_message_via_x3dh_bundle() {
    let bob_identity = IdentityKeyPair::generate();
    let bob_signed_prekey = ECKeyPair::generate();
    let bob_one_time_prekey = ECKeyPair::generate();

    let bundle = PreKeyBundle {
        registration_id: 1,
        device_id: 1,
        pre_key_id: Some(1),
        pre_key_public: Some(bob_one_time_prekey.public_bytes()),
        signed_pre_key_id: 1,
        signed_pre_key_public: bob_signed_prekey.public_bytes(),
        signed_pre_key_signature: [0u8; 64],
        identity_key: bob_identity.public_bytes(),
    };

    let alice_identity = IdentityKeyPair::generate();
    let mut alice_session = RatchetSession::new();
    alice_session.init_outgoing(&bundle, &alice_identity).unwrap();

    let ciphertext = alice_session.encrypt(b"hello bob").unwrap();

    let mut bob_session = RatchetSession::new();
    bob_session
        .init_incoming(
            alice_identity.public_bytes(),
            alice_session_ephemeral_public(&alice_session),
            &bob_identity,
            &bob_signed_prekey,
            Some(&bob_one_time_prekey),
        )
        .unwrap();

    let plaintext = bob_session.decrypt(&ciphertext).unwrap();
    assert_eq!(plaintext, b"hello bob");
}

#[test]
fn ratchet_session_out_of_order_delivery_uses_skipped_keys() {
    let bob_identity = IdentityKeyPair::generate();
    let bob_signed_prekey = ECKeyPair::generate();

    let bundle = PreKeyBundle {
        registration_id: 1,
        device_id: 1,
        pre_key_id: None,
        pre_key_public: None,
        signed_pre_key_id: 1,
        signed_pre_key_public: bob_signed_prekey.public_bytes(),
        signed_pre_key_signature: [0u8; 64],
        identity_key: bob_identity.public_bytes(),
    };

    let alice_identity = IdentityKeyPair::generate();
    let mut alice_session = RatchetSession::new();
    alice_session.init_outgoing(&bundle, &alice_identity).unwrap();

    let first = alice_session.encrypt(b"first").unwrap();
    let second = alice_session.encrypt(b"second").unwrap();

    let mut bob_session = RatchetSession::new();
    bob_session
        .init_incoming(alice_identity.public_bytes(), alice_session_ephemeral_public(&alice_session), &bob_identity, &bob_signed_prekey, None)
        .unwrap();

    // second message arrives first: bob must stash the skipped key for `first`.
    let plaintext_second = bob_session.decrypt(&second).unwrap();
    assert_eq!(plaintext_second, b"second");

    let plaintext_first = bob_session.decrypt(&first).unwrap();
    assert_eq!(plaintext_first, b"first");
}

#[test]
fn ratchet_session_rejects_replayed_counter() {
    let bob_identity = IdentityKeyPair::generate();
    let bob_signed_prekey = ECKeyPair::generate();
    let bundle = PreKeyBundle {
        registration_id: 1,
        device_id: 1,
        pre_key_id: None,
        pre_key_public: None,
        signed_pre_key_id: 1,
        signed_pre_key_public: bob_signed_prekey.public_bytes(),
        signed_pre_key_signature: [0u8; 64],
        identity_key: bob_identity.public_bytes(),
    };

    let alice_identity = IdentityKeyPair::generate();
    let mut alice_session = RatchetSession::new();
    alice_session.init_outgoing(&bundle, &alice_identity).unwrap();
    let message = alice_session.encrypt(b"only once").unwrap();

    let mut bob_session = RatchetSession::new();
    bob_session
        .init_incoming(alice_identity.public_bytes(), alice_session_ephemeral_public(&alice_session), &bob_identity, &bob_signed_prekey, None)
        .unwrap();

    bob_session.decrypt(&message).unwrap();
    let replayed = bob_session.decrypt(&message);
    assert!(replayed.is_err());
}

#[test]
fn provisioning_cipher_round_trips_and_rejects_foreign_account() {
    let primary_identity = IdentityKeyPair::generate();
    let secondary_ephemeral = ECKeyPair::generate();

    let message = ProvisionMessage {
        identity_key_private: primary_identity.private_bytes().to_vec(),
        addr: "00000000-0000-0000-0000-000000000001".to_string(),
        provisioning_code: "123-456".to_string(),
        user_agent: Some("test-harness".to_string()),
    };

    let envelope = ProvisioningCipher::encrypt(&secondary_ephemeral.public_bytes(), &message).unwrap();
    let decrypted = ProvisioningCipher::decrypt(&secondary_ephemeral.private_bytes(), &envelope).unwrap();
    assert_eq!(decrypted.addr, message.addr);
    assert_eq!(decrypted.provisioning_code, message.provisioning_code);

    let ok = ProvisioningCipher::decrypt_and_verify(&secondary_ephemeral.private_bytes(), &envelope, &message.addr);
    assert!(ok.is_ok());

    let rejected = ProvisioningCipher::decrypt_and_verify(
        &secondary_ephemeral.private_bytes(),
        &envelope,
        "00000000-0000-0000-0000-000000000099",
    );
    assert!(rejected.is_err());
}

#[test]
fn provisioning_envelope_rejects_tampered_body() {
    let secondary_ephemeral = ECKeyPair::generate();
    let message = ProvisionMessage {
        identity_key_private: [7u8; 32].to_vec(),
        addr: "00000000-0000-0000-0000-000000000001".to_string(),
        provisioning_code: "000-000".to_string(),
        user_agent: None,
    };
    let mut envelope = ProvisioningCipher::encrypt(&secondary_ephemeral.public_bytes(), &message).unwrap();
    let last = envelope.body.len() - 1;
    envelope.body[last] ^= 0xFF;

    assert!(ProvisioningCipher::decrypt(&secondary_ephemeral.private_bytes(), &envelope).is_err());
}

#[test]
fn payload_round_trips_through_exchange_encoding() {
    let payload = PayloadV1 {
        sender: Sender { user_id: "00000000-0000-0000-0000-000000000001".to_string(), device: 1 },
        distribution: Distribution { expression: "@alice".to_string() },
        thread_id: "thread-1".to_string(),
        thread_type: "conversation".to_string(),
        thread_title: Some("Alice & Bob".to_string()),
        message_type: "content".to_string(),
        message_id: "msg-1".to_string(),
        message_ref: None,
        user_agent: "integration-test".to_string(),
        data: PayloadData {
            body: vec![BodyItem { r#type: "text/plain".to_string(), value: "hi".to_string() }],
            control: None,
            actions: None,
            action_options: None,
        },
        attachments: None,
    };

    let encoded = Payload::v1(payload).encode().unwrap();
    assert!(encoded.contains("\"version\":1"));

    let decoded = Payload::decode_highest_known(&encoded).unwrap();
    match decoded {
        Payload::V1(p) => {
            assert_eq!(p.thread_id, "thread-1");
            assert_eq!(p.data.body[0].value, "hi");
        }
    }
}

#[test]
fn tag_parsing_handles_scheme_and_default() {
    assert_eq!(parse_tag("@alice"), ("alice".to_string(), "forsta".to_string()));
    assert_eq!(parse_tag("alice:example"), ("alice".to_string(), "example".to_string()));
    assert_eq!(parse_tag("@alice:example"), ("alice".to_string(), "example".to_string()));
}

#[test]
fn address_parses_and_displays_bare_and_device_forms() {
    let uuid = Uuid::new_v4();
    let bare: Address = uuid.to_string().parse().unwrap();
    assert_eq!(bare.device_id, None);
    assert_eq!(bare.to_string(), uuid.to_string());

    let with_device: Address = format!("{}.3", uuid).parse().unwrap();
    assert_eq!(with_device.device_id, Some(3));
    assert_eq!(with_device.to_string(), format!("{}.3", uuid));

    assert!(format!("{}.3.4", uuid).parse::<Address>().is_err());
}

#[tokio::test]
async fn stub_atlas_client_resolves_registered_distributions() {
    let user_id = Uuid::new_v4();
    let atlas = stub_atlas(user_id, 1, "https://relay.example.test");
    atlas.distributions.lock().unwrap().insert(
        "@alice".to_string(),
        ResolvedDistribution { userids: vec![user_id.to_string()], universal: "@alice".to_string() },
    );

    let resolved = atlas.resolve_tags("@alice").await.unwrap();
    assert_eq!(resolved.userids, vec![user_id.to_string()]);

    let missing = atlas.resolve_tags("@nobody").await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn store_save_identity_reports_change_and_purges_sessions() {
    let store = MemoryKeyStore::new();
    let user_id = "00000000-0000-0000-0000-000000000042";
    let addr = Address::new(Uuid::parse_str(user_id).unwrap(), Some(1));

    let first_changed = store.save_identity(user_id, [1u8; 32]).await.unwrap();
    assert!(!first_changed);

    store.store_session(addr, vec![9, 9, 9]).await.unwrap();
    assert!(store.load_session(addr).await.unwrap().is_some());

    let second_changed = store.save_identity(user_id, [2u8; 32]).await.unwrap();
    assert!(second_changed);
    assert!(store.load_session(addr).await.unwrap().is_none());
}

#[test]
fn receiver_websocket_envelope_decrypt_matches_encrypt() {
    use signal_client::receiver::decrypt_websocket_message;
    use signal_client::util::crypto::{aes_cbc_encrypt, hmac_sha256, random_bytes};

    let signaling_key = random_bytes(52);
    let aes_key = &signaling_key[0..32];
    let mac_key = &signaling_key[32..52];
    let iv = random_bytes(16);
    let plaintext = b"a decrypted envelope body";
    let ciphertext = aes_cbc_encrypt(aes_key, &iv, plaintext).unwrap();

    let mut mac_input = vec![0x01u8];
    mac_input.extend_from_slice(&iv);
    mac_input.extend_from_slice(&ciphertext);
    let mac = hmac_sha256(mac_key, &mac_input, 10).unwrap();
    let mut body = mac_input;
    body.extend_from_slice(&mac);

    let decrypted = decrypt_websocket_message(&body, &signaling_key).unwrap();
    assert_eq!(decrypted, plaintext);
}
