//! Application callbacks
//!
//! The core never talks to the network. PEP publish/download and message
//! delivery are supplied by the application through this trait; every
//! method is a suspension point in the cooperative model.

use async_trait::async_trait;
use thiserror::Error;
use weft_core::{BareJid, DeviceId};

use crate::backend::{Bundle, EncryptedKey};
use crate::trust::TrustLevel;

/// A failed application callback. Timeouts imposed by the application
/// surface here and are reported as per-device failures where applicable.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

/// One advertised device in a PEP device list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnouncedDevice {
    /// The device id
    pub device_id: DeviceId,
    /// Optional human-readable label
    pub label: Option<String>,
}

/// The application-provided side effects.
///
/// Device lists and bundles are per backend namespace — each OMEMO version
/// publishes to its own PEP node.
#[async_trait]
pub trait AppCallbacks: Send + Sync {
    /// Fetch the device list `jid` advertises for `namespace`
    async fn download_device_list(
        &self,
        jid: &BareJid,
        namespace: &str,
    ) -> Result<Vec<AnnouncedDevice>, CallbackError>;

    /// Publish our amended device list for `namespace`
    async fn upload_device_list(
        &self,
        jid: &BareJid,
        namespace: &str,
        devices: &[AnnouncedDevice],
    ) -> Result<(), CallbackError>;

    /// Fetch one device's bundle; `Ok(None)` means the server holds none
    async fn download_bundle(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        namespace: &str,
    ) -> Result<Option<Bundle>, CallbackError>;

    /// Publish our bundle for `namespace`; returning `Ok` confirms
    /// publication and clears the modified bit
    async fn upload_bundle(&self, namespace: &str, bundle: &Bundle)
        -> Result<(), CallbackError>;

    /// Deliver an empty OMEMO message (session completion or staleness
    /// response) to one device
    async fn send_empty_message(
        &self,
        namespace: &str,
        jid: &BareJid,
        device_id: DeviceId,
        key: &EncryptedKey,
    ) -> Result<(), CallbackError>;

    /// Translate a custom trust label into a core trust level
    async fn evaluate_custom_trust(
        &self,
        jid: &BareJid,
        identity_key: &[u8],
        label: &str,
    ) -> TrustLevel;
}
