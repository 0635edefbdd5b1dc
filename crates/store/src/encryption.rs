//! Encrypts `MessageHistoryRecord::message_data` at rest, keyed per tenant.
//!
//! Each tenant's `secret_key` is hashed down to a 256-bit AES key with
//! SHA-256 rather than stored directly as key material, so two tenants never
//! share ciphertext even if their plaintext payloads happen to collide.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("ciphertext is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("ciphertext too short to contain a nonce")]
    Truncated,
}

fn derive_key(secret_key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret_key.as_bytes());
    hasher.finalize().into()
}

/// Encrypt `plaintext` under a key derived from `secret_key`. Returns
/// base64 of `nonce || ciphertext`.
pub fn encrypt(secret_key: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
    let key_bytes = derive_key(secret_key);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(combined))
}

/// Inverse of `encrypt`.
pub fn decrypt(secret_key: &str, encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let combined = BASE64.decode(encoded)?;
    if combined.len() < NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

    let key_bytes = derive_key(secret_key);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))
}
