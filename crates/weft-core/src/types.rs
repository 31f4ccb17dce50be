//! Core identifiers used throughout Weft

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A bare XMPP address (localpart@domainpart, no resource)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BareJid(String);

impl BareJid {
    /// Create from a string, rejecting resource parts and empty input
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() {
            return Err(Error::InvalidJid("empty".to_string()));
        }
        if s.contains('/') {
            return Err(Error::InvalidJid(format!("'{s}' carries a resource part")));
        }
        Ok(Self(s))
    }

    /// Get as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BareJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for BareJid {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A 32-bit OMEMO device identifier
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Create from a raw id
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
