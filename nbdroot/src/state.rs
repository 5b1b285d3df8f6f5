//! Attach sequence state machine.
//!
//! ```text
//! Init → ModulePresent → DeviceReady → NetworkReadyOrTimedOut
//!      → Connecting(named-export) ─┬─→ Connected → Verified
//!                                  └─→ Connecting(legacy) → Connected → Verified
//!
//! Any non-terminal state → Failed
//! ```

use nbdroot_shared::errors::{NbdrootError, NbdrootResult};
use nbdroot_shared::Variant;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the attach sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Init,
    ModulePresent,
    DeviceReady,
    /// Network wait finished, whether or not the network came up.
    NetworkReadyOrTimedOut,
    Connecting(Variant),
    Connected(Variant),
    /// Connected and the device served a read.
    Verified,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Verified | SessionState::Failed)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        match (self, target) {
            (Init, ModulePresent) => true,
            (ModulePresent, DeviceReady) => true,
            (DeviceReady, NetworkReadyOrTimedOut) => true,
            (NetworkReadyOrTimedOut, Connecting(v)) => v.is_primary(),
            // Exactly one fallback, from the primary variant only
            (Connecting(from), Connecting(to)) => from.is_primary() && !to.is_primary(),
            (Connecting(from), Connected(to)) => *from == to,
            (Connected(_), Verified) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => f.write_str("init"),
            SessionState::ModulePresent => f.write_str("module-present"),
            SessionState::DeviceReady => f.write_str("device-ready"),
            SessionState::NetworkReadyOrTimedOut => f.write_str("network-ready-or-timed-out"),
            SessionState::Connecting(v) => write!(f, "connecting({})", v),
            SessionState::Connected(v) => write!(f, "connected({})", v),
            SessionState::Verified => f.write_str("verified"),
            SessionState::Failed => f.write_str("failed"),
        }
    }
}

/// Tracks the current state and the trail of states visited.
#[derive(Debug, Clone)]
pub struct StateMachine {
    trail: Vec<SessionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            trail: vec![SessionState::Init],
        }
    }

    pub fn current(&self) -> SessionState {
        self.trail
            .last()
            .copied()
            .unwrap_or(SessionState::Init)
    }

    /// Every state visited, in order, starting with `Init`.
    pub fn trail(&self) -> &[SessionState] {
        &self.trail
    }

    /// Move to `next`, rejecting edges the machine does not allow.
    pub fn advance(&mut self, next: SessionState) -> NbdrootResult<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(NbdrootError::Internal(format!(
                "illegal state transition {} → {}",
                current, next
            )));
        }
        tracing::debug!(from = %current, to = %next, "state transition");
        self.trail.push(next);
        Ok(())
    }

    /// Enter `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.current().is_terminal() {
            self.trail.push(SessionState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_primary_path() {
        let mut machine = StateMachine::new();
        for next in [
            ModulePresent,
            DeviceReady,
            NetworkReadyOrTimedOut,
            Connecting(Variant::WithExportName),
            Connected(Variant::WithExportName),
            Verified,
        ] {
            machine.advance(next).unwrap();
        }
        assert_eq!(machine.current(), Verified);
        assert_eq!(
            machine
                .trail()
                .iter()
                .filter(|s| matches!(s, Connecting(_)))
                .count(),
            1
        );
    }

    #[test]
    fn test_fallback_is_single_step() {
        assert!(Connecting(Variant::WithExportName).can_transition_to(Connecting(Variant::Legacy)));
        assert!(!Connecting(Variant::Legacy).can_transition_to(Connecting(Variant::Legacy)));
        assert!(!Connecting(Variant::Legacy).can_transition_to(Connecting(Variant::WithExportName)));
        assert!(!NetworkReadyOrTimedOut.can_transition_to(Connecting(Variant::Legacy)));
    }

    #[test]
    fn test_connected_must_match_variant() {
        assert!(Connecting(Variant::Legacy).can_transition_to(Connected(Variant::Legacy)));
        assert!(!Connecting(Variant::Legacy).can_transition_to(Connected(Variant::WithExportName)));
    }

    #[test]
    fn test_cannot_skip_stages() {
        let mut machine = StateMachine::new();
        assert!(machine.advance(DeviceReady).is_err());
        assert_eq!(machine.current(), Init);
    }

    #[test]
    fn test_fail_from_any_non_terminal() {
        let mut machine = StateMachine::new();
        machine.advance(ModulePresent).unwrap();
        machine.fail();
        assert_eq!(machine.current(), Failed);

        // Failing twice leaves a single Failed entry
        machine.fail();
        assert_eq!(machine.trail(), &[Init, ModulePresent, Failed]);
        assert!(!Verified.can_transition_to(Failed));
    }
}
