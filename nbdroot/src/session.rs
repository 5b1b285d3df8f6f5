//! Remote block session setup with protocol-variant fallback.
//!
//! NBD servers differ in how much of the newstyle negotiation they support.
//! The named-export variant is tried first; if it fails, exactly one attempt
//! is made without an export name. There is no third variant.

use async_trait::async_trait;
use nbdroot_shared::errors::NbdrootError;
use nbdroot_shared::{AttemptOutcome, ConnectionAttempt, RemoteTarget, Variant};
use std::path::{Path, PathBuf};

use crate::outcome::{Stage, StageOutcome};
use crate::report::Diagnostics;
use crate::state::{SessionState, StateMachine};

/// Everything the transport needs for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub variant: Variant,
    pub target: &'a RemoteTarget,
    pub device: &'a Path,
    pub export_name: &'a str,
    /// Ask the transport to reconnect on link loss once the session is up.
    pub persist: bool,
}

/// OS-side NBD client.
#[async_trait]
pub trait NbdTransport: Send + Sync {
    /// Bind `request.device` to the remote export. Blocks for as long as the
    /// client's own connect timeout allows. The error is the failure reason.
    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<(), String>;
}

/// `nbd-client` from nbd-tools.
pub struct NbdClient {
    binary: PathBuf,
}

impl NbdClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Command-line arguments for one attempt.
    ///
    /// ```text
    /// named-export: <host> <port> <device> -N <export> [-persist]
    /// legacy:       <host> <port> <device> [-persist]
    /// ```
    pub fn args(request: &ConnectRequest<'_>) -> Vec<String> {
        let mut args = vec![
            request.target.host().to_string(),
            request.target.port().to_string(),
            request.device.display().to_string(),
        ];
        if request.variant == Variant::WithExportName {
            args.push("-N".to_string());
            args.push(request.export_name.to_string());
        }
        if request.persist {
            args.push("-persist".to_string());
        }
        args
    }
}

#[async_trait]
impl NbdTransport for NbdClient {
    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<(), String> {
        let args = Self::args(request);
        tracing::debug!("{} {}", self.binary.display(), args.join(" "));

        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| format!("Failed to run {}: {}", self.binary.display(), e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} exited with {}", self.binary.display(), output.status));
        Err(reason)
    }
}

/// Attempts recorded by one establishment run and the stage result.
#[derive(Debug)]
pub struct SessionReport {
    pub attempts: Vec<ConnectionAttempt>,
    pub outcome: StageOutcome<Variant>,
}

/// Opens the session, trying variants in priority order.
pub struct SessionEstablisher<'a> {
    transport: &'a dyn NbdTransport,
    export_name: &'a str,
}

impl<'a> SessionEstablisher<'a> {
    pub fn new(transport: &'a dyn NbdTransport, export_name: &'a str) -> Self {
        Self {
            transport,
            export_name,
        }
    }

    /// Walk `Connecting(primary) → [Connecting(fallback)] → Connected`.
    ///
    /// At most two attempts; the first success ends the sequence.
    pub async fn establish(
        &self,
        target: &RemoteTarget,
        device: &Path,
        machine: &mut StateMachine,
        diag: &mut Diagnostics,
    ) -> SessionReport {
        let mut attempts = Vec::with_capacity(Variant::PRIORITY.len());

        for variant in Variant::PRIORITY {
            if let Err(e) = machine.advance(SessionState::Connecting(variant)) {
                return SessionReport {
                    attempts,
                    outcome: StageOutcome::Fatal(e),
                };
            }

            let request = ConnectRequest {
                variant,
                target,
                device,
                export_name: self.export_name,
                persist: variant.is_primary(),
            };

            match self.transport.connect(&request).await {
                Ok(()) => {
                    attempts.push(ConnectionAttempt {
                        variant,
                        outcome: AttemptOutcome::Success,
                    });
                    let outcome = match machine.advance(SessionState::Connected(variant)) {
                        Ok(()) => {
                            diag.info(
                                Stage::Session,
                                format!("{} bound to {} ({})", device.display(), target, variant),
                            );
                            StageOutcome::Ok(variant)
                        }
                        Err(e) => StageOutcome::Fatal(e),
                    };
                    return SessionReport { attempts, outcome };
                }
                Err(reason) => {
                    attempts.push(ConnectionAttempt {
                        variant,
                        outcome: AttemptOutcome::Failure(reason.clone()),
                    });
                    if variant.is_primary() {
                        diag.warn(
                            Stage::Session,
                            format!(
                                "{}; falling back to {} negotiation",
                                NbdrootError::SessionFailedPrimary { reason },
                                Variant::Legacy
                            ),
                        );
                    } else {
                        diag.info(Stage::Session, format!("{} attempt failed: {}", variant, reason));
                    }
                }
            }
        }

        SessionReport {
            outcome: StageOutcome::Fatal(NbdrootError::SessionFailedAll {
                attempts: attempts.clone(),
            }),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbdroot_shared::NbdrootResult;
    use std::sync::Mutex;

    fn establish_result(report: &SessionReport) -> NbdrootResult<Variant> {
        match &report.outcome {
            StageOutcome::Ok(v) | StageOutcome::Advisory(v, _) => Ok(*v),
            StageOutcome::Fatal(e) => Err(NbdrootError::Internal(e.to_string())),
        }
    }

    struct Scripted {
        named: Result<(), String>,
        legacy: Result<(), String>,
        calls: Mutex<Vec<(Variant, bool)>>,
    }

    impl Scripted {
        fn new(named: Result<(), &str>, legacy: Result<(), &str>) -> Self {
            Self {
                named: named.map_err(str::to_string),
                legacy: legacy.map_err(str::to_string),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NbdTransport for Scripted {
        async fn connect(&self, request: &ConnectRequest<'_>) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push((request.variant, request.persist));
            match request.variant {
                Variant::WithExportName => self.named.clone(),
                Variant::Legacy => self.legacy.clone(),
            }
        }
    }

    fn ready_machine() -> StateMachine {
        let mut machine = StateMachine::new();
        machine.advance(SessionState::ModulePresent).unwrap();
        machine.advance(SessionState::DeviceReady).unwrap();
        machine.advance(SessionState::NetworkReadyOrTimedOut).unwrap();
        machine
    }

    fn target() -> RemoteTarget {
        RemoteTarget::parse("10.0.0.5:10809").unwrap()
    }

    #[test]
    fn test_args_per_variant() {
        let target = target();
        let device = Path::new("/dev/nbd0");
        let mut request = ConnectRequest {
            variant: Variant::WithExportName,
            target: &target,
            device,
            export_name: "root",
            persist: true,
        };
        assert_eq!(
            NbdClient::args(&request),
            vec!["10.0.0.5", "10809", "/dev/nbd0", "-N", "root", "-persist"]
        );

        request.variant = Variant::Legacy;
        request.persist = false;
        assert_eq!(
            NbdClient::args(&request),
            vec!["10.0.0.5", "10809", "/dev/nbd0"]
        );
    }

    #[tokio::test]
    async fn test_primary_success_single_attempt() {
        let transport = Scripted::new(Ok(()), Ok(()));
        let mut machine = ready_machine();
        let mut diag = Diagnostics::default();

        let report = SessionEstablisher::new(&transport, "")
            .establish(&target(), Path::new("/dev/nbd0"), &mut machine, &mut diag)
            .await;

        assert_eq!(establish_result(&report).unwrap(), Variant::WithExportName);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(
            *transport.calls.lock().unwrap(),
            vec![(Variant::WithExportName, true)]
        );
        assert_eq!(
            machine.current(),
            SessionState::Connected(Variant::WithExportName)
        );
    }

    #[tokio::test]
    async fn test_fallback_after_primary_failure() {
        let transport = Scripted::new(Err("E: server does not support NBD_OPT_GO"), Ok(()));
        let mut machine = ready_machine();
        let mut diag = Diagnostics::default();

        let report = SessionEstablisher::new(&transport, "")
            .establish(&target(), Path::new("/dev/nbd0"), &mut machine, &mut diag)
            .await;

        assert_eq!(establish_result(&report).unwrap(), Variant::Legacy);
        assert_eq!(report.attempts.len(), 2);
        assert!(!report.attempts[0].succeeded());
        assert!(report.attempts[1].succeeded());
        assert_eq!(
            machine.trail()[machine.trail().len() - 3..],
            [
                SessionState::Connecting(Variant::WithExportName),
                SessionState::Connecting(Variant::Legacy),
                SessionState::Connected(Variant::Legacy),
            ]
        );
        assert_eq!(
            diag.lines()
                .iter()
                .filter(|d| d.message.contains("falling back"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_both_fail_names_both_variants() {
        let transport = Scripted::new(Err("export not found"), Err("connection refused"));
        let mut machine = ready_machine();
        let mut diag = Diagnostics::default();

        let report = SessionEstablisher::new(&transport, "")
            .establish(&target(), Path::new("/dev/nbd0"), &mut machine, &mut diag)
            .await;

        match &report.outcome {
            StageOutcome::Fatal(NbdrootError::SessionFailedAll { attempts }) => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].variant, Variant::WithExportName);
                assert_eq!(attempts[1].variant, Variant::Legacy);
            }
            other => panic!("expected SessionFailedAll, got {:?}", other),
        }
        assert_eq!(transport.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_client_binary_is_a_failure_reason() {
        let client = NbdClient::new("/nonexistent/nbd-client");
        let target = target();
        let request = ConnectRequest {
            variant: Variant::Legacy,
            target: &target,
            device: Path::new("/dev/nbd0"),
            export_name: "",
            persist: false,
        };
        let reason = client.connect(&request).await.unwrap_err();
        assert!(reason.starts_with("Failed to run /nonexistent/nbd-client"));
    }
}
