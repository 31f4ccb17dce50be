//! Device-list registry
//!
//! Caches the merged device lists per bare JID. Each backend advertises
//! its own list; a device id seen in several backends' lists is one
//! physical device and the union of those backends determines its
//! supported namespaces. A device is active iff it currently appears in
//! at least one backend's list; inactive records are retained.

use std::collections::BTreeSet;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use weft_core::{BareJid, DeviceId};

use crate::callbacks::AnnouncedDevice;
use crate::error::Result;
use crate::store::StoreFacade;

/// One known device of some bare JID
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// The owning bare JID
    pub jid: BareJid,
    /// The device id (unique per JID, assumed unique across backends for
    /// the same physical device)
    pub device_id: DeviceId,
    /// Optional human-readable label
    pub label: Option<String>,
    /// Identity public key, normalized to Curve25519 form; empty until a
    /// bundle or session first revealed it
    #[serde(with = "hex::serde")]
    pub identity_key: Vec<u8>,
    /// Namespaces currently advertising this device
    pub namespaces: BTreeSet<String>,
}

impl DeviceRecord {
    /// A device is active iff some backend currently lists it
    pub fn active(&self) -> bool {
        !self.namespaces.is_empty()
    }

    /// Whether this device supports `namespace`
    pub fn supports(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }
}

/// Outcome of merging one backend's advertised list
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// The own device id was missing and has been re-appended; the
    /// amended list must be republished
    pub own_list_amended: bool,
}

/// Per-JID device cache, write-through to storage
pub struct DeviceRegistry {
    store: StoreFacade,
    own_jid: BareJid,
    cache: RwLock<HashMap<BareJid, Vec<DeviceRecord>>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new(store: StoreFacade, own_jid: BareJid) -> Self {
        Self {
            store,
            own_jid,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The records cached (or stored) for `jid`
    pub async fn records(&self, jid: &BareJid) -> Result<Vec<DeviceRecord>> {
        if let Some(records) = self.cache.read().get(jid) {
            return Ok(records.clone());
        }
        let records = self.store.load_device_records(jid).await?;
        self.cache.write().insert(jid.clone(), records.clone());
        Ok(records)
    }

    /// Whether `device_id` is cached for `jid`
    pub async fn knows_device(&self, jid: &BareJid, device_id: DeviceId) -> Result<bool> {
        Ok(self
            .records(jid)
            .await?
            .iter()
            .any(|r| r.device_id == device_id))
    }

    /// Merge one backend's advertised device list for `jid`.
    ///
    /// Listed devices gain the namespace (and become active); previously
    /// listed devices absent from this update lose it. For the own JID the
    /// own device id is re-appended when missing, per XEP-0384 §4.2.
    pub async fn process_update(
        &self,
        jid: &BareJid,
        namespace: &str,
        announced: &[AnnouncedDevice],
        own_device: Option<(DeviceId, Option<String>)>,
    ) -> Result<ProcessOutcome> {
        let mut records = self.records(jid).await?;
        let mut outcome = ProcessOutcome::default();

        let announced_ids: BTreeSet<DeviceId> =
            announced.iter().map(|d| d.device_id).collect();

        for device in announced {
            match records.iter().position(|r| r.device_id == device.device_id) {
                Some(index) => {
                    let record = &mut records[index];
                    if record.namespaces.insert(namespace.to_string()) {
                        debug!(
                            jid = %jid,
                            device = %device.device_id,
                            namespace,
                            "device gained backend support"
                        );
                    }
                    if device.label.is_some() {
                        record.label = device.label.clone();
                    }
                }
                None => {
                    records.push(DeviceRecord {
                        jid: jid.clone(),
                        device_id: device.device_id,
                        label: device.label.clone(),
                        identity_key: Vec::new(),
                        namespaces: BTreeSet::from([namespace.to_string()]),
                    });
                }
            }
        }

        for record in records.iter_mut() {
            if !announced_ids.contains(&record.device_id)
                && record.namespaces.remove(namespace)
            {
                debug!(
                    jid = %jid,
                    device = %record.device_id,
                    namespace,
                    "device lost backend support"
                );
            }
        }

        if jid == &self.own_jid {
            if let Some((own_id, own_label)) = own_device {
                match records.iter().position(|r| r.device_id == own_id) {
                    Some(index) => {
                        if records[index].namespaces.insert(namespace.to_string()) {
                            outcome.own_list_amended = true;
                        }
                    }
                    None => {
                        records.push(DeviceRecord {
                            jid: jid.clone(),
                            device_id: own_id,
                            label: own_label,
                            identity_key: Vec::new(),
                            namespaces: BTreeSet::from([namespace.to_string()]),
                        });
                        outcome.own_list_amended = true;
                    }
                }
            }
        }

        self.store.store_device_records(jid, &records).await?;
        self.cache.write().insert(jid.clone(), records);
        Ok(outcome)
    }

    /// Record a device's identity key once a bundle or session revealed it
    pub async fn set_identity_key(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        identity_key: &[u8],
    ) -> Result<()> {
        let mut records = self.records(jid).await?;
        let Some(record) = records.iter_mut().find(|r| r.device_id == device_id) else {
            return Ok(());
        };
        if record.identity_key == identity_key {
            return Ok(());
        }
        record.identity_key = identity_key.to_vec();
        self.store.store_device_records(jid, &records).await?;
        self.cache.write().insert(jid.clone(), records);
        Ok(())
    }

    /// Update the label of one device (used for own-label changes)
    pub async fn set_label(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        label: Option<String>,
    ) -> Result<()> {
        let mut records = self.records(jid).await?;
        let Some(record) = records.iter_mut().find(|r| r.device_id == device_id) else {
            return Ok(());
        };
        record.label = label;
        self.store.store_device_records(jid, &records).await?;
        self.cache.write().insert(jid.clone(), records);
        Ok(())
    }

    /// The list to announce for `namespace`: all active devices carrying it
    pub async fn announced_list(
        &self,
        jid: &BareJid,
        namespace: &str,
    ) -> Result<Vec<AnnouncedDevice>> {
        Ok(self
            .records(jid)
            .await?
            .iter()
            .filter(|r| r.supports(namespace))
            .map(|r| AnnouncedDevice {
                device_id: r.device_id,
                label: r.label.clone(),
            })
            .collect())
    }

    /// Make sure the own device is cached with the given namespaces.
    /// Returns whether the record was created or extended.
    pub async fn ensure_own_device(
        &self,
        device_id: DeviceId,
        label: Option<String>,
        identity_key: &[u8],
        namespaces: impl IntoIterator<Item = String>,
    ) -> Result<bool> {
        let own = self.own_jid.clone();
        let mut records = self.records(&own).await?;
        let namespaces: BTreeSet<String> = namespaces.into_iter().collect();

        let changed = match records.iter().position(|r| r.device_id == device_id) {
            Some(index) => {
                let record = &mut records[index];
                let mut changed = false;
                for ns in &namespaces {
                    changed |= record.namespaces.insert(ns.clone());
                }
                if record.identity_key != identity_key {
                    record.identity_key = identity_key.to_vec();
                    changed = true;
                }
                changed
            }
            None => {
                records.push(DeviceRecord {
                    jid: own.clone(),
                    device_id,
                    label,
                    identity_key: identity_key.to_vec(),
                    namespaces,
                });
                true
            }
        };

        if changed {
            self.store.store_device_records(&own, &records).await?;
            self.cache.write().insert(own, records);
        }
        Ok(changed)
    }

    /// All device ids cached for the own JID (own-device-id collision check)
    pub async fn own_cached_ids(&self) -> Result<BTreeSet<DeviceId>> {
        Ok(self
            .records(&self.own_jid)
            .await?
            .iter()
            .map(|r| r.device_id)
            .collect())
    }

    /// Drop a JID from the cache (after a purge)
    pub fn evict(&self, jid: &BareJid) {
        self.cache.write().remove(jid);
    }
}
