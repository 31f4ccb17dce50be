//! # Weft OMEMO
//!
//! The cross-backend orchestration core of an OMEMO (XEP-0384) end-to-end
//! encrypted messaging library.
//!
//! Per-version cryptographic backends (each implementing one OMEMO
//! namespace atop X3DH and a Double Ratchet) plug into a single
//! [`SessionManager`] that owns the shared identity key, device-list
//! caches, the own-bundle lifecycle, trust evaluation, per-recipient
//! message dispatch, catch-up gating, and automated staleness responses.
//!
//! The application supplies the network side (PEP publish/download, message
//! delivery) as async callbacks and persistence as an opaque key-value
//! store; backends supply all session cryptography.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod backend;
pub mod bundle;
pub mod callbacks;
pub mod catchup;
pub mod config;
pub mod devices;
pub mod error;
pub mod manager;
pub mod stale;
pub mod store;
pub mod trust;

pub use backend::{
    Backend, BackendError, Bundle, EncryptedKey, IdentityKeyFormat, KeyExchange,
    OneTimePreKeyPublic, SignedPreKeyPublic, SkippedKeyLimits,
};
pub use callbacks::{AnnouncedDevice, AppCallbacks, CallbackError};
pub use config::{ManagerConfig, UndecidedPolicy};
pub use devices::DeviceRecord;
pub use error::{DeviceFailure, FailedDevice, OmemoError, Result};
pub use manager::{
    DecryptedMessage, DeviceInfo, EncryptedMessage, Payload, PayloadError, ReceivedMessage,
    SessionManager,
};
pub use trust::TrustLevel;

/// Hard cap on published one-time pre keys per bundle
pub const MAX_ONE_TIME_PRE_KEYS: usize = 100;
