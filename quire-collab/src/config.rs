//! Engine configuration.
//!
//! Every section has working defaults; a JSON document only needs the keys
//! it overrides:
//!
//! ```json
//! {
//!   "connection": { "max_attempts": 8 },
//!   "channel":    { "grace_period_ms": 2000 },
//!   "presence":   { "inactivity_timeout_ms": 45000 },
//!   "autosave":   { "idle_period_ms": 10000 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::channel::ChannelConfig;
use crate::connection::ReconnectPolicy;
use crate::error::{CollabError, Result};
use crate::presence::PresenceConfig;
use crate::versions::AutosaveConfig;

/// `Duration` as integer milliseconds, for `#[serde(with = ...)]`.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub connection: ReconnectPolicy,
    pub channel: ChannelConfig,
    pub presence: PresenceConfig,
    pub autosave: AutosaveConfig,
}

impl CollabConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CollabError::Validation(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Validation(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CollabError::Validation(format!("cannot serialize config: {e}")))
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_attempts == 0 {
            return Err(CollabError::Validation("max_attempts must be at least 1".into()));
        }
        if self.connection.base_delay > self.connection.max_delay {
            return Err(CollabError::Validation("base_delay exceeds max_delay".into()));
        }
        if self.channel.heartbeat_interval.is_zero() || self.presence.sweep_interval.is_zero() {
            return Err(CollabError::Validation("timer intervals must be non-zero".into()));
        }
        if self.presence.eviction_grace < self.presence.inactivity_timeout {
            return Err(CollabError::Validation(
                "eviction_grace must not be shorter than inactivity_timeout".into(),
            ));
        }
        Ok(())
    }
}
