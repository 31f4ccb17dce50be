//! Error types for identity-key operations

use thiserror::Error;

/// Result type alias for identity-key operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during identity-key operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid public key
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// The stored identity key has no Ed25519 form
    #[error("Stored identity key is Curve25519-only; no Ed25519 form can be derived")]
    EdUnavailable,

    /// Serialized key material was malformed
    #[error("Malformed key material: {0}")]
    MalformedKeyMaterial(String),
}
