//! Error taxonomy of the orchestration core
//!
//! Per-device failures during an encryption fan-out are bucketed and
//! returned alongside the successful entries; whole-operation failures
//! abort without partial state.

use thiserror::Error;
use weft_core::{BareJid, DeviceId};

use crate::backend::BackendError;

/// Result type alias
pub type Result<T> = std::result::Result<T, OmemoError>;

/// Whole-operation errors
#[derive(Debug, Error)]
pub enum OmemoError {
    /// Storage read failed before the commit phase
    #[error("Storage error: {0}")]
    Storage(#[from] weft_core::Error),

    /// A write in the commit group failed; the operation result was
    /// discarded and no further writes were issued
    #[error("Storage commit failed: {0}")]
    StorageCommitFailed(String),

    /// Identity-key operation failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] weft_crypto::CryptoError),

    /// One or more target devices have an undecided trust level; the
    /// application must resolve them in bulk and retry
    #[error("Trust still undecided for {} device(s)", .0.len())]
    StillUndecided(Vec<(BareJid, DeviceId)>),

    /// The sender's identity key is distrusted
    #[error("Sender {jid} (device {device}) is distrusted")]
    SenderDistrusted {
        /// Sender bare JID
        jid: BareJid,
        /// Sender device id
        device: DeviceId,
    },

    /// No session exists for the sender of a non-pre-key message
    #[error("No session with {jid} (device {device})")]
    NoSession {
        /// Sender bare JID
        jid: BareJid,
        /// Sender device id
        device: DeviceId,
    },

    /// A pre-key message re-used an already-consumed one-time pre key
    /// outside of catch-up mode
    #[error("Duplicated pre-key message from {jid} (device {device})")]
    DuplicatedPreKeyMessage {
        /// Sender bare JID
        jid: BareJid,
        /// Sender device id
        device: DeviceId,
    },

    /// The session with the sender is unusable
    #[error("Session with {jid} (device {device}) is broken: {reason}")]
    SessionBroken {
        /// Peer bare JID
        jid: BareJid,
        /// Peer device id
        device: DeviceId,
        /// Backend-reported reason
        reason: String,
    },

    /// The stored identity key cannot serve a loaded backend's key format
    #[error("Identity key format incompatible with backend {namespace}")]
    IdentityKeyFormatIncompatible {
        /// The backend that could not be served
        namespace: String,
    },

    /// No loaded backend matches the given namespace
    #[error("Unknown backend namespace: {0}")]
    UnknownNamespace(String),

    /// Configuration rejected at creation
    #[error("Configuration error: {0}")]
    Config(String),

    /// An application callback failed outside of per-device bucketing
    #[error("Application callback failed: {0}")]
    Callback(String),

    /// The decrypted bytes did not decode to the application payload type
    #[error("Payload decode failed: {0}")]
    PayloadDecode(String),

    /// A backend operation failed outside of per-device bucketing
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Why one device was dropped from an encryption fan-out
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceFailure {
    /// The bundle download callback failed
    BundleDownloadFailed {
        /// Callback-reported reason
        reason: String,
    },
    /// The server holds no bundle for this device
    BundleNotFound,
    /// No backend in the priority list is supported by this device
    NoEligibleBackend,
    /// The session with this device is unusable; a later operation may
    /// rebuild it from a fresh bundle
    SessionBroken {
        /// Backend-reported reason
        reason: String,
    },
    /// The backend rejected the downloaded bundle
    BundleCorrupted {
        /// Backend-reported reason
        reason: String,
    },
}

/// A per-device failure bucketed during an encryption fan-out
#[derive(Clone, Debug)]
pub struct FailedDevice {
    /// The device's bare JID
    pub jid: BareJid,
    /// The device id
    pub device_id: DeviceId,
    /// What went wrong
    pub failure: DeviceFailure,
}
