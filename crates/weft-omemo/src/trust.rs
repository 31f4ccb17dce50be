//! Trust engine
//!
//! Trust is attached to identity keys, not devices: entries are keyed by
//! `(bare JID, identity-key bytes)` and hold arbitrary application-defined
//! labels. Translation into the three core levels goes through the
//! application's `evaluate_custom_trust` callback; new identity keys are
//! inserted at the configured default label on first sight.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use weft_core::{BareJid, DeviceId};

use crate::callbacks::AppCallbacks;
use crate::error::Result;
use crate::store::StoreFacade;

/// The core trust levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Encrypt to / decrypt from this identity key
    Trusted,
    /// Never encrypt to this identity key; reject its messages
    Distrusted,
    /// The application has not decided yet
    Undecided,
}

/// Custom-label trust storage plus callback translation
pub struct TrustEngine {
    store: StoreFacade,
    callbacks: Arc<dyn AppCallbacks>,
    default_label: String,
}

impl TrustEngine {
    /// Create the engine with the configured default label
    pub fn new(store: StoreFacade, callbacks: Arc<dyn AppCallbacks>, default_label: String) -> Self {
        Self {
            store,
            callbacks,
            default_label,
        }
    }

    /// The stored label for an identity key, inserting the default for
    /// keys seen for the first time
    pub async fn label(&self, jid: &BareJid, identity_key: &[u8]) -> Result<String> {
        if let Some(label) = self.store.load_trust_label(jid, identity_key).await? {
            return Ok(label);
        }
        self.store
            .store_trust_label(jid, identity_key, &self.default_label)
            .await?;
        Ok(self.default_label.clone())
    }

    /// Overwrite the label for an identity key
    pub async fn set_trust(
        &self,
        jid: &BareJid,
        identity_key: &[u8],
        label: &str,
    ) -> Result<()> {
        self.store.store_trust_label(jid, identity_key, label).await
    }

    /// Translate one identity key's label into a core level
    pub async fn evaluate(&self, jid: &BareJid, identity_key: &[u8]) -> Result<TrustLevel> {
        let label = self.label(jid, identity_key).await?;
        Ok(self
            .callbacks
            .evaluate_custom_trust(jid, identity_key, &label)
            .await)
    }

    /// Bulk query used by the encryption fan-out: evaluate every device's
    /// identity key, preserving order
    pub async fn evaluate_devices(
        &self,
        devices: &[(BareJid, DeviceId, Vec<u8>)],
    ) -> Result<Vec<TrustLevel>> {
        let mut levels = Vec::with_capacity(devices.len());
        for (jid, _, identity_key) in devices {
            levels.push(self.evaluate(jid, identity_key).await?);
        }
        Ok(levels)
    }

    /// Remove every trust entry for one bare JID
    pub async fn purge_jid(&self, jid: &BareJid) -> Result<()> {
        self.store.purge_trust(jid).await
    }
}
