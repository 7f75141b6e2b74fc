//! Unit tests for the sync payload cipher.

use agent_steward::sync::crypto::{
    decrypt_json, encrypt_json, AesGcmCipher, Cipher, EncryptionVariant,
};
use agent_steward::AppError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

#[test]
fn sealed_payload_starts_with_data_key_variant() {
    let cipher = AesGcmCipher::new(&[3; 32]);
    let sealed = cipher.encrypt(b"hello").expect("encrypt");
    assert_eq!(sealed[0], EncryptionVariant::DataKey.byte());
    assert_eq!(sealed.len(), 1 + 12 + b"hello".len() + 16);
}

#[test]
fn nonces_differ_between_calls() {
    let cipher = AesGcmCipher::new(&[3; 32]);
    let a = cipher.encrypt(b"same").expect("encrypt");
    let b = cipher.encrypt(b"same").expect("encrypt");
    assert_ne!(a, b);
}

#[test]
fn json_payload_survives_encryption() {
    let cipher = AesGcmCipher::new(&[9; 32]);
    let payload = json!({"directory": "/work", "agent": "codex"});
    let encoded = encrypt_json(&cipher, &payload).expect("encrypt");
    let decoded: Value = decrypt_json(&cipher, &encoded).expect("decrypt");
    assert_eq!(decoded, payload);
}

#[test]
fn tampered_payload_is_rejected() {
    let cipher = AesGcmCipher::new(&[9; 32]);
    let mut sealed = cipher.encrypt(b"{\"a\":1}").expect("encrypt");
    let last = sealed.len() - 1;
    sealed[last] ^= 0xff;
    assert!(cipher.decrypt(&sealed).is_none());
}

#[test]
fn truncated_or_empty_payload_is_rejected() {
    let cipher = AesGcmCipher::new(&[9; 32]);
    assert!(cipher.decrypt(&[]).is_none());
    assert!(cipher.decrypt(&[EncryptionVariant::DataKey.byte(), 1, 2, 3]).is_none());
}

#[test]
fn unknown_variant_byte_is_rejected() {
    assert!(EncryptionVariant::from_byte(7).is_none());
    let cipher = AesGcmCipher::new(&[9; 32]);
    let mut sealed = cipher.encrypt(b"{}").expect("encrypt");
    sealed[0] = 7;
    assert!(cipher.decrypt(&sealed).is_none());
}

#[test]
fn non_base64_input_is_crypto_error() {
    let cipher = AesGcmCipher::new(&[9; 32]);
    let result: Result<Value, _> = decrypt_json(&cipher, "not base64 !!");
    assert!(matches!(result, Err(AppError::Crypto(_))));
}

#[test]
fn undecodable_plaintext_is_crypto_error() {
    let cipher = AesGcmCipher::new(&[9; 32]);
    let sealed = cipher.encrypt(b"not json").expect("encrypt");
    let result: Result<Value, _> = decrypt_json(&cipher, &STANDARD.encode(sealed));
    assert!(matches!(result, Err(AppError::Crypto(_))));
}
