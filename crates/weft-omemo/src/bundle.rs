//! Bundle lifecycle bookkeeping
//!
//! The backend owns the key material; the core owns the schedule: when the
//! signed pre key rotates, when one-time pre keys are replenished, and when
//! the application must republish. A `modified` bit is raised by any
//! structural change and cleared once the application confirms publication.
//! Failed publications retry with a doubled backoff, starting at one
//! second and capped at the rotation period. Rotation is deferred while
//! catch-up is active.

use serde::{Deserialize, Serialize};

/// Initial publish retry backoff in seconds
pub const INITIAL_PUBLISH_BACKOFF_SECS: i64 = 1;

/// Per-backend lifecycle record, persisted alongside the backend state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BundleLifecycle {
    /// When the signed pre key last rotated (Unix seconds)
    pub last_rotation: i64,
    /// The bundle changed structurally and awaits republication
    pub modified: bool,
    /// Current publish retry backoff in seconds
    pub publish_backoff_secs: i64,
    /// Earliest next publish attempt (Unix seconds); 0 means immediately
    pub next_publish_at: i64,
}

impl BundleLifecycle {
    /// Fresh record for a backend that was just created. The bundle has
    /// never been published, so it starts modified.
    pub fn fresh(now: i64) -> Self {
        Self {
            last_rotation: now,
            modified: true,
            publish_backoff_secs: INITIAL_PUBLISH_BACKOFF_SECS,
            next_publish_at: 0,
        }
    }

    /// Whether the signed pre key is due for rotation
    pub fn rotation_due(&self, now: i64, period_secs: i64) -> bool {
        now - self.last_rotation >= period_secs
    }

    /// Record a completed rotation
    pub fn record_rotation(&mut self, now: i64) {
        self.last_rotation = now;
        self.modified = true;
    }

    /// Record any other structural change (replenishment, consumed pre key)
    pub fn record_change(&mut self) {
        self.modified = true;
    }

    /// Whether a publish attempt may run now
    pub fn publish_due(&self, now: i64) -> bool {
        self.modified && now >= self.next_publish_at
    }

    /// The application confirmed publication
    pub fn record_published(&mut self) {
        self.modified = false;
        self.publish_backoff_secs = INITIAL_PUBLISH_BACKOFF_SECS;
        self.next_publish_at = 0;
    }

    /// A publish attempt failed; double the backoff, capped at the
    /// rotation period
    pub fn record_publish_failure(&mut self, now: i64, period_secs: i64) {
        self.next_publish_at = now + self.publish_backoff_secs;
        self.publish_backoff_secs = (self.publish_backoff_secs * 2).min(period_secs);
    }
}
