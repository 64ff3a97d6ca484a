//! Sealing primitives for the TikTools license cache.
//!
//! - ChaCha20-Poly1305 authenticated encryption
//! - Argon2id derivation of a cipher key from machine-bound secret material
//!
//! The license cache uses these for tamper resistance of a local file. The
//! key is derived from data available on the same machine, so this is not a
//! confidentiality boundary.

mod cipher;
mod error;
mod key;

pub use cipher::{NONCE_SIZE, TAG_SIZE, open_json, seal_json};
pub use error::{CryptoError, CryptoResult};
pub use key::{KEY_SIZE, SealingKey};
