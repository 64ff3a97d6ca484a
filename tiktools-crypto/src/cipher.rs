//! Sealing serialized values with ChaCha20-Poly1305.
//!
//! A sealed blob is `nonce || ciphertext || tag`. Opening fails on a wrong
//! key and on any modified byte.

use crate::error::{CryptoError, CryptoResult};
use crate::key::SealingKey;
use chacha20poly1305::Nonce;
use chacha20poly1305::aead::Aead;
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Nonce length (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;

/// Serializes `value` to JSON and seals it under a fresh random nonce.
pub fn seal_json<T: Serialize>(key: &SealingKey, value: &T) -> CryptoResult<Vec<u8>> {
    let plaintext = serde_json::to_vec(value)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| CryptoError::Seal)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Opens a blob produced by [`seal_json`] and decodes the JSON inside.
pub fn open_json<T: DeserializeOwned>(key: &SealingKey, sealed: &[u8]) -> CryptoResult<T> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Open)?;
    Ok(serde_json::from_slice(&plaintext)?)
}
