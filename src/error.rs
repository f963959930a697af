//! Error types and handling for Padlock

use thiserror::Error;

/// Result type alias for Padlock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Padlock error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("No key stored for conversation {0}")]
    KeyNotFound(String),

    #[error("Key state corrupted: {0}")]
    KeyCorrupted(String),

    #[error("Insufficient key material: need {needed} bytes, have {available}")]
    InsufficientKey { needed: u64, available: u64 },

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Could not acquire the send lock: {0}")]
    LockAcquisition(String),

    #[error("Transient store error: {0}")]
    StoreTransient(String),

    #[error("Permanent store error: {0}")]
    StorePermanent(String),

    #[error("Decrypted envelope corrupted: {0}")]
    DecryptCorrupted(String),

    #[error("Key exchange timed out: {0}")]
    KexTimeout(String),

    #[error("No segment was received by every participant")]
    KexNoCompleteSegment,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl Error {
    /// Whether retrying the failed operation can succeed without intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreTransient(_) | Error::LockAcquisition(_))
    }
}
