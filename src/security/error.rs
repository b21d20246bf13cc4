//! Error types for the cryptographic layer and the secure collaborators.
//!
//! Messages are deliberately generic: they never carry key material,
//! plaintext fragments or ciphertext.

use thiserror::Error;

/// Failure to produce ciphertext, a MAC or a derived key.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("master key is not available")]
    MasterKeyUnavailable,

    #[error("master key must be at least {0} bytes")]
    MasterKeyTooShort(usize),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Cipher,
}

/// Failure to recover plaintext.
///
/// Tag mismatch, wrong context, wrong key, malformed fields and non-UTF-8
/// output all collapse into this single opaque error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("decryption failed")]
pub struct DecryptionError;

/// Failure of a secure collaborator (config loader, resource detector).
#[derive(Debug, Error)]
pub enum SecureAccessError {
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("invalid input: {}", .0.join("; "))]
    InvalidInput(Vec<String>),

    #[error("integrity check failed for {0}")]
    IntegrityViolation(String),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<anyhow::Error> for SecureAccessError {
    fn from(e: anyhow::Error) -> Self {
        SecureAccessError::Source(e.into())
    }
}
