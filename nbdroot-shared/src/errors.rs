//! Error taxonomy for the NBD root attach sequence.
//!
//! Errors are categorized by what the sequence does with them:
//! - Non-fatal: the stage is skipped or the failure is only logged
//!   (`ParameterAbsent`, `ParameterMalformed`, `NetworkTimedOut`,
//!   `ConnectivityUnreachable`, `SessionFailedPrimary`)
//! - Fatal: the sequence stops and the boot outcome is a failure
//!   (everything else)
//!
//! See [`NbdrootError::is_fatal`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::attempt::ConnectionAttempt;

/// Errors that can occur while attaching the remote root device.
#[derive(Debug, Error)]
pub enum NbdrootError {
    /// No `nbdroot=` on the kernel command line.
    #[error("no nbdroot= parameter on the kernel command line")]
    ParameterAbsent,

    /// `nbdroot=` present but not `<host>:<port>`.
    #[error("malformed nbdroot parameter '{value}': {reason}")]
    ParameterMalformed { value: String, reason: String },

    /// The nbd driver could not be loaded.
    #[error("kernel module {module}: {reason}")]
    ModuleLoadFailed { module: String, reason: String },

    /// The device node is missing and cannot be created, or has the wrong identity.
    #[error("device node {}: {reason}", .path.display())]
    DeviceNodeUnavailable { path: PathBuf, reason: String },

    /// No global address and default route appeared before the deadline.
    #[error("network not ready after {}s", .0.as_secs())]
    NetworkTimedOut(Duration),

    /// Reachability check against the server failed.
    #[error("{host} unreachable: {reason}")]
    ConnectivityUnreachable { host: String, reason: String },

    /// The named-export variant failed; the legacy variant is still to be tried.
    #[error("primary connection failed: {reason}")]
    SessionFailedPrimary { reason: String },

    /// Every protocol variant failed.
    #[error("all connection variants failed: {}", describe_attempts(.attempts))]
    SessionFailedAll { attempts: Vec<ConnectionAttempt> },

    /// The session is up but the device does not serve data.
    #[error("device {} unreadable: {reason}", .path.display())]
    DeviceUnreadable { path: PathBuf, reason: String },

    /// Transient state file could not be read or written.
    #[error("storage: {0}")]
    Storage(String),

    /// Programming error (e.g. an illegal state transition).
    #[error("internal: {0}")]
    Internal(String),
}

/// Result alias used across the workspace.
pub type NbdrootResult<T> = Result<T, NbdrootError>;

impl NbdrootError {
    /// Whether this error ends the sequence with a failed boot outcome.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            NbdrootError::ParameterAbsent
                | NbdrootError::ParameterMalformed { .. }
                | NbdrootError::NetworkTimedOut(_)
                | NbdrootError::ConnectivityUnreachable { .. }
                | NbdrootError::SessionFailedPrimary { .. }
        )
    }

    /// Create a module load error.
    pub fn module_load(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ModuleLoadFailed {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Create a device node error.
    pub fn device_node(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DeviceNodeUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a readability error.
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DeviceUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

fn describe_attempts(attempts: &[ConnectionAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::{AttemptOutcome, Variant};

    #[test]
    fn test_fatal_split() {
        assert!(!NbdrootError::ParameterAbsent.is_fatal());
        assert!(!NbdrootError::NetworkTimedOut(Duration::from_secs(30)).is_fatal());
        assert!(!NbdrootError::SessionFailedPrimary {
            reason: "refused".into()
        }
        .is_fatal());

        assert!(NbdrootError::module_load("nbd", "not found").is_fatal());
        assert!(NbdrootError::device_node("/dev/nbd0", "read-only").is_fatal());
        assert!(NbdrootError::unreadable("/dev/nbd0", "eof").is_fatal());
        assert!(NbdrootError::SessionFailedAll { attempts: vec![] }.is_fatal());
    }

    #[test]
    fn test_session_failed_all_names_every_variant() {
        let err = NbdrootError::SessionFailedAll {
            attempts: vec![
                ConnectionAttempt {
                    variant: Variant::WithExportName,
                    outcome: AttemptOutcome::Failure("export not found".into()),
                },
                ConnectionAttempt {
                    variant: Variant::Legacy,
                    outcome: AttemptOutcome::Failure("connection refused".into()),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("named-export failed: export not found"));
        assert!(msg.contains("legacy failed: connection refused"));
    }

    #[test]
    fn test_error_display() {
        let err = NbdrootError::NetworkTimedOut(Duration::from_secs(30));
        assert_eq!(err.to_string(), "network not ready after 30s");

        let err = NbdrootError::device_node("/dev/nbd0", "not a block device");
        assert_eq!(
            err.to_string(),
            "device node /dev/nbd0: not a block device"
        );
    }
}
