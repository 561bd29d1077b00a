use std::time::Duration;

use enostr::RelayConfig;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Tunables for the timeline engine. Durations are in milliseconds so the
/// config stays plain json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// How long a subscription waits on a relay's EOSE before treating it
    /// as settled with whatever it sent
    pub eose_timeout_ms: u64,
    /// EOSE timeout for the short-lived pagination subscriptions
    pub load_more_timeout_ms: u64,
    /// `limit` used for local-first timelines
    pub default_limit: u64,
    /// `limit` sent to relays when the caller doesn't choose one
    pub remote_limit: u64,
    pub relay: RelayConfig,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            eose_timeout_ms: 5_000,
            load_more_timeout_ms: 5_000,
            default_limit: 500,
            remote_limit: 250,
            relay: RelayConfig::default(),
        }
    }
}

impl TimelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn eose_timeout(&self) -> Duration {
        Duration::from_millis(self.eose_timeout_ms)
    }

    pub fn load_more_timeout(&self) -> Duration {
        Duration::from_millis(self.load_more_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config =
            TimelineConfig::from_json(r#"{"eose_timeout_ms": 1500, "relay": {"ping_rate_ms": 1000}}"#)
                .expect("config");

        assert_eq!(config.eose_timeout(), Duration::from_millis(1500));
        assert_eq!(config.load_more_timeout(), Duration::from_secs(5));
        assert_eq!(config.remote_limit, 250);
        assert_eq!(config.relay.ping_rate(), Duration::from_secs(1));
        assert_eq!(config.relay.grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(TimelineConfig::from_json("{not json").is_err());
    }
}
