use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use url::Url;

pub mod connection;
pub mod message;
pub mod registry;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RelayStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// [`RelayStatus`] shared between a connection task and its observers
#[derive(Debug)]
pub(crate) struct AtomicRelayStatus(AtomicU8);

impl AtomicRelayStatus {
    pub fn new(status: RelayStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn set(&self, status: RelayStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    pub fn get(&self) -> RelayStatus {
        match self.0.load(Ordering::Acquire) {
            x if x == RelayStatus::Connected as u8 => RelayStatus::Connected,
            x if x == RelayStatus::Connecting as u8 => RelayStatus::Connecting,
            _ => RelayStatus::Disconnected,
        }
    }
}

/// A normalized relay url. `wss://Relay.Example/` and `wss://relay.example`
/// name the same relay and therefore share one connection.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn new(url: &str) -> Self {
        RelayUrl(canonicalize_url(url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// standardize the format (ie, trailing slashes)
fn canonicalize_url(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(parsed) => {
            let s = parsed.to_string();
            if parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none() {
                s.trim_end_matches('/').to_owned()
            } else {
                s
            }
        }
        // If parsing fails, keep what we were given
        Err(_) => url.to_owned(),
    }
}

impl From<String> for RelayUrl {
    fn from(url: String) -> Self {
        RelayUrl::new(&url)
    }
}

impl From<&str> for RelayUrl {
    fn from(url: &str) -> Self {
        RelayUrl::new(url)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayUrl({})", self.0)
    }
}

/// Bounded exponential backoff between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 5_000,
            multiplier: 1.5,
            max_ms: 300_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// The delay that follows `current`, capped at `max_ms`
    pub fn next(&self, current: Duration) -> Duration {
        let next = (current.as_millis() as f64 * self.multiplier.max(1.0)) as u64;
        Duration::from_millis(next.min(self.max_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long an unreferenced connection stays open for reuse
    pub grace_period_ms: u64,
    /// Keepalive ping interval while connected
    pub ping_rate_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            ping_rate_ms: 25_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn ping_rate(&self) -> Duration {
        Duration::from_millis(self.ping_rate_ms)
    }
}

/// Close reasons produced by the connection layer itself
pub mod close_reason {
    /// we closed the subscription or the connection
    pub const CLOSED_BY_CALLER: &str = "closed by caller";
    /// the socket went away; a reconnect is scheduled
    pub const CONNECTION_CLOSED: &str = "relay connection closed";
    /// prefix of socket and connect errors; a reconnect is scheduled
    pub const CONNECTION_ERRORED: &str = "relay connection errored";
}
