//! Staleness detection and deferred empty-message queues
//!
//! A session is stale when the peer's sending chain reached 53 messages
//! without hearing back from us; the peer cannot advance its ratchet until
//! we send. The responder records such sessions and — once catch-up ended —
//! sends at most one empty OMEMO message per session. The same persisted
//! queue mechanism carries the confirming empty messages for passive
//! sessions built during catch-up.

use serde::{Deserialize, Serialize};
use weft_core::{BareJid, DeviceId};

use crate::error::Result;
use crate::store::StoreFacade;

/// Peer sending-chain length at which a session counts as stale
pub const STALE_SENDING_CHAIN_LENGTH: u32 = 53;

/// One queued empty-message response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResponse {
    /// Backend namespace of the session
    pub namespace: String,
    /// Peer bare JID
    pub jid: BareJid,
    /// Peer device id
    pub device_id: DeviceId,
}

/// A persisted at-most-once response queue
pub struct ResponseQueue {
    store: StoreFacade,
    name: &'static str,
}

impl ResponseQueue {
    /// Open the queue persisted under `name`
    pub fn new(store: StoreFacade, name: &'static str) -> Self {
        Self { store, name }
    }

    /// Queue a response unless one is already pending for the session
    pub async fn schedule(&self, entry: PendingResponse) -> Result<bool> {
        let mut entries: Vec<PendingResponse> = self.store.load_queue(self.name).await?;
        if entries.contains(&entry) {
            return Ok(false);
        }
        entries.push(entry);
        self.store.store_queue(self.name, &entries).await?;
        Ok(true)
    }

    /// Take every pending entry, clearing the queue
    pub async fn drain(&self) -> Result<Vec<PendingResponse>> {
        let entries: Vec<PendingResponse> = self.store.load_queue(self.name).await?;
        if !entries.is_empty() {
            self.store
                .store_queue::<PendingResponse>(self.name, &[])
                .await?;
        }
        Ok(entries)
    }

    /// Drop pending entries for one bare JID (after a purge)
    pub async fn remove_jid(&self, jid: &BareJid) -> Result<()> {
        let entries: Vec<PendingResponse> = self.store.load_queue(self.name).await?;
        let kept: Vec<PendingResponse> =
            entries.into_iter().filter(|e| &e.jid != jid).collect();
        self.store.store_queue(self.name, &kept).await?;
        Ok(())
    }
}

/// Whether a received chain length marks the session as stale
pub fn is_stale(receiving_chain_length: u32) -> bool {
    receiving_chain_length >= STALE_SENDING_CHAIN_LENGTH
}
