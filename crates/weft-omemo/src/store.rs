//! Typed facade over the application's key-value store
//!
//! All keys live under a versioned `weft/v1/` prefix so backend-supplied
//! migrations can target older layouts. Writes go through immediately;
//! nothing is cached on the write path.

use std::sync::Arc;

use weft_core::{BareJid, DeviceId, KeyValueStore, KeyValueStoreExt};
use weft_crypto::StoredIdentityKey;

use crate::bundle::BundleLifecycle;
use crate::devices::DeviceRecord;
use crate::error::Result;

const PREFIX: &str = "weft/v1";

/// Typed views over the opaque store, shared across the manager's
/// components
#[derive(Clone)]
pub struct StoreFacade {
    kv: Arc<dyn KeyValueStore>,
}

impl StoreFacade {
    /// Wrap an application-provided store
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// The underlying store
    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    fn identity_key_key() -> String {
        format!("{PREFIX}/own/identity")
    }

    fn own_device_id_key() -> String {
        format!("{PREFIX}/own/device-id")
    }

    fn own_label_key() -> String {
        format!("{PREFIX}/own/label")
    }

    fn rotation_period_key() -> String {
        format!("{PREFIX}/own/rotation-period")
    }

    fn backend_state_key(namespace: &str) -> String {
        format!("{PREFIX}/backend/{namespace}/state")
    }

    fn lifecycle_key(namespace: &str) -> String {
        format!("{PREFIX}/backend/{namespace}/lifecycle")
    }

    fn device_list_key(jid: &BareJid) -> String {
        format!("{PREFIX}/devices/{jid}")
    }

    fn session_key(jid: &BareJid, device_id: DeviceId, namespace: &str) -> String {
        format!("{PREFIX}/sessions/{jid}/{device_id}/{namespace}")
    }

    fn session_prefix(jid: &BareJid) -> String {
        format!("{PREFIX}/sessions/{jid}/")
    }

    fn trust_key(jid: &BareJid, identity_key: &[u8]) -> String {
        format!("{PREFIX}/trust/{jid}/{}", hex::encode(identity_key))
    }

    fn trust_prefix(jid: &BareJid) -> String {
        format!("{PREFIX}/trust/{jid}/")
    }

    fn queue_key(name: &str) -> String {
        format!("{PREFIX}/own/queue/{name}")
    }

    /// Load the persisted identity key, if any
    pub async fn load_identity(&self) -> Result<Option<StoredIdentityKey>> {
        Ok(self.kv.load_json(&Self::identity_key_key()).await?)
    }

    /// Persist the identity key
    pub async fn store_identity(&self, key: &StoredIdentityKey) -> Result<()> {
        Ok(self.kv.store_json(&Self::identity_key_key(), key).await?)
    }

    /// Load the own device id, if any
    pub async fn load_own_device_id(&self) -> Result<Option<DeviceId>> {
        Ok(self
            .kv
            .load_json::<u32>(&Self::own_device_id_key())
            .await?
            .map(DeviceId::from))
    }

    /// Persist the own device id
    pub async fn store_own_device_id(&self, id: DeviceId) -> Result<()> {
        Ok(self
            .kv
            .store_json(&Self::own_device_id_key(), &id.value())
            .await?)
    }

    /// Load the own device label override, if any
    pub async fn load_own_label(&self) -> Result<Option<String>> {
        Ok(self.kv.load_json(&Self::own_label_key()).await?)
    }

    /// Persist the own device label
    pub async fn store_own_label(&self, label: &str) -> Result<()> {
        Ok(self.kv.store_json(&Self::own_label_key(), &label).await?)
    }

    /// Load the sampled rotation period, if any
    pub async fn load_rotation_period(&self) -> Result<Option<i64>> {
        Ok(self.kv.load_json(&Self::rotation_period_key()).await?)
    }

    /// Persist the rotation period
    pub async fn store_rotation_period(&self, secs: i64) -> Result<()> {
        Ok(self
            .kv
            .store_json(&Self::rotation_period_key(), &secs)
            .await?)
    }

    /// Load one backend's opaque state blob
    pub async fn load_backend_state(&self, namespace: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.load(&Self::backend_state_key(namespace)).await?)
    }

    /// Persist one backend's opaque state blob
    pub async fn store_backend_state(&self, namespace: &str, state: Vec<u8>) -> Result<()> {
        Ok(self
            .kv
            .store(&Self::backend_state_key(namespace), state)
            .await?)
    }

    /// Load one backend's bundle lifecycle record
    pub async fn load_lifecycle(&self, namespace: &str) -> Result<Option<BundleLifecycle>> {
        Ok(self.kv.load_json(&Self::lifecycle_key(namespace)).await?)
    }

    /// Persist one backend's bundle lifecycle record
    pub async fn store_lifecycle(
        &self,
        namespace: &str,
        lifecycle: &BundleLifecycle,
    ) -> Result<()> {
        Ok(self
            .kv
            .store_json(&Self::lifecycle_key(namespace), lifecycle)
            .await?)
    }

    /// Load the cached device records for one bare JID
    pub async fn load_device_records(&self, jid: &BareJid) -> Result<Vec<DeviceRecord>> {
        Ok(self
            .kv
            .load_json(&Self::device_list_key(jid))
            .await?
            .unwrap_or_default())
    }

    /// Persist the device records for one bare JID
    pub async fn store_device_records(
        &self,
        jid: &BareJid,
        records: &[DeviceRecord],
    ) -> Result<()> {
        Ok(self
            .kv
            .store_json(&Self::device_list_key(jid), &records)
            .await?)
    }

    /// Load one session blob
    pub async fn load_session(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        namespace: &str,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .kv
            .load(&Self::session_key(jid, device_id, namespace))
            .await?)
    }

    /// Persist one session blob
    pub async fn store_session(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        namespace: &str,
        blob: Vec<u8>,
    ) -> Result<()> {
        Ok(self
            .kv
            .store(&Self::session_key(jid, device_id, namespace), blob)
            .await?)
    }

    /// Load the trust label for one (JID, identity key) pair
    pub async fn load_trust_label(
        &self,
        jid: &BareJid,
        identity_key: &[u8],
    ) -> Result<Option<String>> {
        Ok(self
            .kv
            .load_json(&Self::trust_key(jid, identity_key))
            .await?)
    }

    /// Persist the trust label for one (JID, identity key) pair
    pub async fn store_trust_label(
        &self,
        jid: &BareJid,
        identity_key: &[u8],
        label: &str,
    ) -> Result<()> {
        Ok(self
            .kv
            .store_json(&Self::trust_key(jid, identity_key), &label)
            .await?)
    }

    /// Delete all trust entries for one bare JID
    pub async fn purge_trust(&self, jid: &BareJid) -> Result<()> {
        for key in self.kv.list_prefix(&Self::trust_prefix(jid)).await? {
            self.kv.delete(&key).await?;
        }
        Ok(())
    }

    /// Load a persisted pending-response queue
    pub async fn load_queue<T: serde::de::DeserializeOwned + Send>(
        &self,
        name: &str,
    ) -> Result<Vec<T>> {
        Ok(self
            .kv
            .load_json(&Self::queue_key(name))
            .await?
            .unwrap_or_default())
    }

    /// Persist a pending-response queue
    pub async fn store_queue<T: serde::Serialize + Sync>(
        &self,
        name: &str,
        entries: &[T],
    ) -> Result<()> {
        Ok(self.kv.store_json(&Self::queue_key(name), &entries).await?)
    }

    /// Remove all device, session, and trust data for one bare JID.
    /// The identity key and backend state are untouched.
    pub async fn purge_jid(&self, jid: &BareJid) -> Result<()> {
        self.kv.delete(&Self::device_list_key(jid)).await?;
        for key in self.kv.list_prefix(&Self::session_prefix(jid)).await? {
            self.kv.delete(&key).await?;
        }
        self.purge_trust(jid).await?;
        Ok(())
    }
}
