//! Error types for the sealing layer.

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("sealing failed")]
    Seal,

    /// Wrong key, or the blob was modified.
    #[error("sealed data could not be opened")]
    Open,

    #[error("sealed data too short: {0} bytes")]
    Truncated(usize),

    /// The value did not serialize, or the opened JSON has the wrong shape.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
