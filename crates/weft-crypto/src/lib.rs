//! # Weft Crypto
//!
//! Identity-key material for the Weft OMEMO session manager.
//!
//! Weft delegates all session cryptography (X3DH, Double Ratchet, AEAD) to
//! per-version backends; the one piece of key material the core owns is the
//! long-lived identity key shared across backends. This crate provides that
//! key pair, its Ed25519 and Curve25519 forms, and the conversions between
//! them.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod identity;

pub use error::{CryptoError, Result};
pub use identity::{
    ed_public_to_mont, verify_detached, IdentityKeyMaterial, IdentityKeyPair, MontIdentityKey,
    StoredIdentityKey,
};
