//! Error types for the licensing engine.

use thiserror::Error;

/// Result type for calls against the license authority.
pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// Outcome classes of a failed authority call.
///
/// Only [`AuthorityError::Connection`] may route a validation onto the
/// offline path; everything else is a real answer from the authority.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorityError {
    /// The request never reached the authority (DNS, refused, TLS, timeout).
    #[error("connection to license authority failed: {0}")]
    Connection(String),

    /// The authority answered with a 4xx/5xx status.
    #[error("license authority returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The authority answered 2xx with a body we could not decode.
    #[error("unreadable authority response: {0}")]
    Decode(String),
}

impl AuthorityError {
    /// Returns true if the offline path applies to this failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns the HTTP status for authority-reported errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AuthorityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            // connect, timeout, request-build and body-transfer failures all
            // mean the authority never gave us an answer
            Self::Connection(err.to_string())
        }
    }
}

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Authority call failed.
    #[error(transparent)]
    Authority(#[from] AuthorityError),

    /// Cache sealing failed.
    #[error("cache crypto error: {0}")]
    Crypto(#[from] tiktools_crypto::CryptoError),

    /// Cache file could not be written or removed.
    #[error("cache storage error: {0}")]
    Cache(String),

    /// No license key is associated with this session.
    #[error("license not activated")]
    NotActivated,

    /// The authority has no record of the license key.
    #[error("license not found: {0}")]
    NotFound(String),

    /// A background monitor was requested outside a tokio runtime.
    #[error("no async runtime available: {0}")]
    Runtime(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
