//! Session-manager configuration

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{OmemoError, Result};

/// Seconds in one day
const DAY_SECS: i64 = 24 * 3600;

/// How decryption treats a sender whose trust is still undecided
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndecidedPolicy {
    /// Decrypt and flag the result as coming from an undecided sender
    AllowFlagged,
    /// Fail the decryption until trust is resolved
    Reject,
}

/// Configuration supplied at manager creation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum skipped message keys kept per session
    pub max_skipped_message_keys_per_session: u32,
    /// Maximum skipped message keys accepted from a single message;
    /// `None` inherits the per-session limit
    pub max_skipped_message_keys_per_message: Option<u32>,
    /// Signed pre key rotation period in seconds; `None` samples a period
    /// uniformly from [7, 30] days once at account creation
    pub signed_pre_key_rotation_secs: Option<i64>,
    /// Replenish one-time pre keys when fewer than this many remain
    pub pre_key_refill_threshold: u32,
    /// Custom trust label assigned to identity keys on first sight
    pub default_trust_level: String,
    /// Decryption policy for undecided senders
    pub undecided_policy: UndecidedPolicy,
    /// Label announced for the own device
    pub own_device_label: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_skipped_message_keys_per_session: 1000,
            max_skipped_message_keys_per_message: None,
            signed_pre_key_rotation_secs: None,
            pre_key_refill_threshold: 99, // replace after every use
            default_trust_level: "undecided".to_string(),
            undecided_policy: UndecidedPolicy::Reject,
            own_device_label: None,
        }
    }
}

impl ManagerConfig {
    /// Validate the configured bounds
    pub fn validate(&self) -> Result<()> {
        if !(25..=100).contains(&self.pre_key_refill_threshold) {
            return Err(OmemoError::Config(
                "pre_key_refill_threshold must be within [25, 100]".to_string(),
            ));
        }
        if let Some(per_message) = self.max_skipped_message_keys_per_message {
            if per_message == 0 && self.max_skipped_message_keys_per_session != 0 {
                return Err(OmemoError::Config(
                    "max_skipped_message_keys_per_message of 0 requires a per-session limit of 0"
                        .to_string(),
                ));
            }
            if per_message > self.max_skipped_message_keys_per_session {
                return Err(OmemoError::Config(
                    "max_skipped_message_keys_per_message must not exceed the per-session limit"
                        .to_string(),
                ));
            }
        }
        if let Some(secs) = self.signed_pre_key_rotation_secs {
            if secs <= 0 {
                return Err(OmemoError::Config(
                    "signed_pre_key_rotation_secs must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The effective per-message skipped-key limit
    pub fn skipped_keys_per_message(&self) -> u32 {
        self.max_skipped_message_keys_per_message
            .unwrap_or(self.max_skipped_message_keys_per_session)
    }

    /// The rotation period to persist at account creation: the configured
    /// value, or a uniform sample from [7, 30] days
    pub fn rotation_period_or_sample(&self) -> i64 {
        self.signed_pre_key_rotation_secs
            .unwrap_or_else(|| rand::thread_rng().gen_range(7 * DAY_SECS..=30 * DAY_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(ManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_bounds() {
        let mut config = ManagerConfig::default();
        config.pre_key_refill_threshold = 24;
        assert!(config.validate().is_err());

        config.pre_key_refill_threshold = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_per_message_limit_rules() {
        let mut config = ManagerConfig::default();
        config.max_skipped_message_keys_per_message = Some(0);
        assert!(config.validate().is_err());

        config.max_skipped_message_keys_per_session = 0;
        assert!(config.validate().is_ok());

        config.max_skipped_message_keys_per_session = 10;
        config.max_skipped_message_keys_per_message = Some(11);
        assert!(config.validate().is_err());

        config.max_skipped_message_keys_per_message = Some(10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_per_message_inherits_per_session() {
        let config = ManagerConfig::default();
        assert_eq!(config.skipped_keys_per_message(), 1000);
    }

    #[test]
    fn test_rotation_period_sampling() {
        let config = ManagerConfig::default();
        for _ in 0..32 {
            let period = config.rotation_period_or_sample();
            assert!((7 * DAY_SECS..=30 * DAY_SECS).contains(&period));
        }

        let fixed = ManagerConfig {
            signed_pre_key_rotation_secs: Some(12 * DAY_SECS),
            ..Default::default()
        };
        assert_eq!(fixed.rotation_period_or_sample(), 12 * DAY_SECS);
    }
}
