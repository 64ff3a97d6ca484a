//! The cache sealing key.
//!
//! The secret is the raw machine fingerprint, so the key only keeps the
//! cache from being edited or moved between machines by hand. Argon2id runs
//! with small fixed costs; derivation happens once per process.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::KeyInit;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the derived key (ChaCha20 takes 256 bits).
pub const KEY_SIZE: usize = 32;

const SALT_SIZE: usize = 16;
const MEMORY_KIB: u32 = 4 * 1024;
const PASSES: u32 = 1;
const LANES: u32 = 1;

/// Key for sealing and opening cache blobs. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKey {
    bytes: [u8; KEY_SIZE],
}

impl SealingKey {
    /// Derives the key for `secret` in the domain named by `label`.
    ///
    /// Only the first 16 bytes of `label` are used.
    pub fn derive(secret: &[u8], label: &str) -> CryptoResult<Self> {
        let params = Params::new(MEMORY_KIB, PASSES, LANES, Some(KEY_SIZE))
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let mut bytes = [0u8; KEY_SIZE];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(secret, &label_salt(label), &mut bytes)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(Self { bytes })
    }

    pub(crate) fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.bytes).into())
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey([REDACTED])")
    }
}

// Zero-padded so short labels still meet Argon2's minimum salt length.
fn label_salt(label: &str) -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    let src = label.as_bytes();
    let n = src.len().min(SALT_SIZE);
    salt[..n].copy_from_slice(&src[..n]);
    salt
}
