//! Message encryption, hashing, and verification.

use crate::core_channel::{Body, Message};
use crate::error::{BanError, Error};
use crate::test_utils::identity_with_channel;
use crate::types::now_seconds;

#[tokio::test]
async fn test_build_and_decrypt_roundtrip() {
    let (identity, channel, _) = identity_with_channel("alice").await;
    let root_hash = *channel.message_at_offset(0).await.unwrap().unwrap().hash();

    let body = Body::json(&serde_json::json!({"text": "hello"}));
    let content = identity
        .sign_message_body(body.to_proto(), &channel, &[root_hash], 1, now_seconds())
        .unwrap();
    let message = Message::build(&channel, content, vec![root_hash], 1).unwrap();

    let decoded = Message::decrypt(&channel, &message.to_wire()).unwrap();
    assert_eq!(decoded.hash(), message.hash());
    assert_eq!(decoded.parents(), message.parents());
    assert_eq!(decoded.height(), 1);
    assert_eq!(decoded.body(), &Body::Json("{\"text\":\"hello\"}".into()));
    assert!(decoded.verify(&channel));
}

#[tokio::test]
async fn test_hash_covers_encrypted_record() {
    let (identity, channel, _) = identity_with_channel("alice").await;
    let root_hash = *channel.message_at_offset(0).await.unwrap().unwrap().hash();

    let content = identity
        .sign_message_body(
            Body::json(&serde_json::json!({"n": 1})).to_proto(),
            &channel,
            &[root_hash],
            1,
            now_seconds(),
        )
        .unwrap();
    let message = Message::build(&channel, content, vec![root_hash], 1).unwrap();

    let mut wire = message.to_wire();
    wire.encrypted_content[0] ^= 0xff;
    // Tampering changes the hash and breaks decryption.
    let err = Message::decrypt(&channel, &wire).unwrap_err();
    assert!(matches!(err, Error::Ban(BanError::DecryptionFailed)));
}

#[tokio::test]
async fn test_decrypt_rejects_wrong_channel() {
    let (identity, channel, _) = identity_with_channel("alice").await;
    let (_, other_channel, _) = identity_with_channel("bob").await;
    let root_hash = *channel.message_at_offset(0).await.unwrap().unwrap().hash();

    let content = identity
        .sign_message_body(
            Body::json(&serde_json::json!({})).to_proto(),
            &channel,
            &[root_hash],
            1,
            now_seconds(),
        )
        .unwrap();
    let message = Message::build(&channel, content, vec![root_hash], 1).unwrap();

    let err = Message::decrypt(&other_channel, &message.to_wire()).unwrap_err();
    assert!(err.is_ban());
}

#[tokio::test]
async fn test_verify_fails_for_foreign_signer() {
    let (identity, channel, _) = identity_with_channel("alice").await;
    let (mallory, mallory_channel, _) = identity_with_channel("mallory").await;
    let root_hash = *channel.message_at_offset(0).await.unwrap().unwrap().hash();

    // Signed by mallory with mallory's chain, then re-encrypted for
    // alice's channel: the chain does not verify against alice's key.
    let mallory_root = *mallory_channel
        .message_at_offset(0)
        .await
        .unwrap()
        .unwrap()
        .hash();
    let foreign_content = mallory
        .sign_message_body(
            Body::json(&serde_json::json!({})).to_proto(),
            &mallory_channel,
            &[mallory_root],
            1,
            now_seconds(),
        )
        .unwrap();
    let forged = Message::build(&channel, foreign_content, vec![root_hash], 1).unwrap();
    assert!(!forged.verify(&channel));

    let _ = identity;
}

#[tokio::test]
async fn test_root_message_shape() {
    let (_, channel, _) = identity_with_channel("alice").await;
    let root = channel.message_at_offset(0).await.unwrap().unwrap();

    assert!(root.is_root());
    assert!(root.parents().is_empty());
    assert_eq!(root.height(), 0);
    assert_eq!(root.body(), &Body::Root);
    assert!(root.content().chain.is_empty());
    assert!(root.verify(&channel));
}

#[tokio::test]
async fn test_invalid_json_body_rejected() {
    let (identity, channel, _) = identity_with_channel("alice").await;
    let root_hash = *channel.message_at_offset(0).await.unwrap().unwrap().hash();

    // Bypass Body::json to smuggle a non-JSON string.
    let body = crate::proto::Body {
        body: Some(crate::proto::body::Body::Json("not json".into())),
    };
    let content = identity
        .sign_message_body(body, &channel, &[root_hash], 1, now_seconds())
        .unwrap();
    let err = Message::build(&channel, content, vec![root_hash], 1).unwrap_err();
    assert!(matches!(err, Error::Ban(BanError::InvalidJson)));
}
