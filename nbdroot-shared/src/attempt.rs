//! Connection attempt records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// NBD negotiation variant, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Sends an explicit export name and asks the transport to persist.
    WithExportName,
    /// Omits the export-name negotiation, for older or simpler servers.
    Legacy,
}

impl Variant {
    /// Variants in the order they are tried.
    pub const PRIORITY: [Variant; 2] = [Variant::WithExportName, Variant::Legacy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::WithExportName => "named-export",
            Variant::Legacy => "legacy",
        }
    }

    /// Whether this is the first variant tried.
    pub fn is_primary(&self) -> bool {
        matches!(self, Variant::WithExportName)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure(String),
}

/// One entry in the ordered sequence produced by the session establisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    pub variant: Variant,
    pub outcome: AttemptOutcome,
}

impl ConnectionAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success)
    }
}

impl fmt::Display for ConnectionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Success => write!(f, "{} succeeded", self.variant),
            AttemptOutcome::Failure(reason) => write!(f, "{} failed: {}", self.variant, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert_eq!(Variant::PRIORITY[0], Variant::WithExportName);
        assert!(Variant::PRIORITY[0].is_primary());
        assert!(!Variant::PRIORITY[1].is_primary());
    }

    #[test]
    fn test_attempt_display() {
        let ok = ConnectionAttempt {
            variant: Variant::Legacy,
            outcome: AttemptOutcome::Success,
        };
        assert!(ok.succeeded());
        assert_eq!(ok.to_string(), "legacy succeeded");
    }
}
