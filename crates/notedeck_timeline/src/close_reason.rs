use enostr::{close_reason, RelayUrl};
use tracing::debug;

use crate::subscription::EOSE_TIMEOUT;

/// Whether a close reason is worth showing to the user
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CloseSeverity {
    /// expected churn: our own closes, reconnects, idle relays
    Benign,
    Surfaced,
}

/// Lower-cased prefixes of reasons we never surface
const BENIGN_PREFIXES: &[&str] = &[
    close_reason::CLOSED_BY_CALLER,
    close_reason::CONNECTION_CLOSED,
    close_reason::CONNECTION_ERRORED,
    EOSE_TIMEOUT,
    "reconnecting",
    "idle",
    "closed: idle",
    "shutting down",
    "duplicate:",
    "error: duplicate subscription",
    "replaced",
];

pub fn classify_close(reason: &str) -> CloseSeverity {
    let reason = reason.trim().to_lowercase();
    if BENIGN_PREFIXES
        .iter()
        .any(|prefix| reason.starts_with(prefix))
    {
        CloseSeverity::Benign
    } else {
        CloseSeverity::Surfaced
    }
}

/// Decides which relay close reasons reach the user. Extra benign prefixes
/// can be added on top of the built in allow-list.
#[derive(Debug, Clone, Default)]
pub struct CloseReporter {
    extra_benign: Vec<String>,
}

impl CloseReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, prefix: &str) -> Self {
        self.extra_benign.push(prefix.trim().to_lowercase());
        self
    }

    pub fn severity(&self, reason: &str) -> CloseSeverity {
        if classify_close(reason) == CloseSeverity::Benign {
            return CloseSeverity::Benign;
        }

        let reason = reason.trim().to_lowercase();
        if self
            .extra_benign
            .iter()
            .any(|prefix| reason.starts_with(prefix.as_str()))
        {
            CloseSeverity::Benign
        } else {
            CloseSeverity::Surfaced
        }
    }

    /// Logs benign reasons and returns true for the ones to surface
    pub fn should_surface(&self, relay: &RelayUrl, reason: &str) -> bool {
        match self.severity(reason) {
            CloseSeverity::Benign => {
                debug!("{} closed: {}", relay, reason);
                false
            }
            CloseSeverity::Surfaced => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routine_reasons_are_benign() {
        for reason in [
            "closed by caller",
            "relay connection closed",
            "relay connection errored: connection refused",
            "EOSE timeout",
            "duplicate: subscription replaced",
            "  Reconnecting in 5s",
        ] {
            assert_eq!(classify_close(reason), CloseSeverity::Benign, "{reason}");
        }
    }

    #[test]
    fn everything_else_surfaces() {
        for reason in [
            "auth-required: we only serve paid users",
            "restricted: not allowed",
            "",
        ] {
            assert_eq!(classify_close(reason), CloseSeverity::Surfaced, "{reason}");
        }
    }

    #[test]
    fn reporter_extends_the_allow_list() {
        let relay = RelayUrl::new("wss://relay.test");
        let reporter = CloseReporter::new().allow("Rate-Limited:");

        assert!(!reporter.should_surface(&relay, "rate-limited: slow down"));
        assert!(reporter.should_surface(&relay, "blocked: go away"));
        assert!(!reporter.should_surface(&relay, "closed by caller"));
    }
}
