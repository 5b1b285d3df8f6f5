//! Per-stage outcome type.
//!
//! Every stage reports one of three results, and the sequence applies the
//! same policy to all of them:
//!
//! ```text
//! Ok(value)              → advance
//! Advisory(value, err)   → log a warning, advance with value
//! Fatal(err)             → log an error naming the stage, stop
//! ```

use nbdroot_shared::errors::{NbdrootError, NbdrootResult};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::report::Diagnostics;

/// Stage of the boot sequence, used to tag diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Cmdline,
    Module,
    DeviceNode,
    Network,
    Probe,
    Session,
    Verify,
    Outcome,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Cmdline => "cmdline",
            Stage::Module => "module",
            Stage::DeviceNode => "device-node",
            Stage::Network => "network",
            Stage::Probe => "probe",
            Stage::Session => "session",
            Stage::Verify => "verify",
            Stage::Outcome => "outcome",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged result of a single stage.
#[derive(Debug)]
pub enum StageOutcome<T> {
    /// Stage succeeded.
    Ok(T),
    /// Stage failed in a way that must not stop the boot; carries the value
    /// the sequence continues with.
    Advisory(T, NbdrootError),
    /// Stage failed; the sequence stops here.
    Fatal(NbdrootError),
}

impl<T> StageOutcome<T> {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageOutcome::Fatal(_))
    }

    /// Turn an advisory failure into a fatal one (strict policy).
    pub fn escalate(self) -> Self {
        match self {
            StageOutcome::Advisory(_, err) => StageOutcome::Fatal(err),
            other => other,
        }
    }

    /// Apply the sequence policy and record the diagnostic for non-`Ok` results.
    ///
    /// An advisory carrying an error the taxonomy marks fatal still stops the
    /// sequence; a stage cannot downgrade it.
    pub fn settle(self, stage: Stage, diag: &mut Diagnostics) -> NbdrootResult<T> {
        match self {
            StageOutcome::Ok(value) => Ok(value),
            StageOutcome::Advisory(_, err) if err.is_fatal() => {
                StageOutcome::<T>::Fatal(err).settle(stage, diag)
            }
            StageOutcome::Advisory(value, err) => {
                diag.warn(stage, format!("{} (continuing)", err));
                Ok(value)
            }
            StageOutcome::Fatal(err) => {
                diag.error(stage, format!("{} stage failed: {}", stage, err));
                Err(err)
            }
        }
    }
}
