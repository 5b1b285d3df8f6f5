//! Best-effort reachability check.
//!
//! Purely diagnostic. ICMP may be filtered on a path where the NBD port is
//! open, so the result is logged and never gates the connection attempt.

use async_trait::async_trait;
use nbdroot_shared::errors::{NbdrootError, NbdrootResult};
use nbdroot_shared::RemoteTarget;
use std::path::PathBuf;
use std::time::Duration;

use crate::outcome::{Stage, StageOutcome};
use crate::report::Diagnostics;

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Single echo request to `host`.
    async fn echo(&self, host: &str, timeout: Duration) -> NbdrootResult<()>;

    /// TCP connect to the NBD port, closed immediately.
    async fn connect(&self, target: &RemoteTarget, timeout: Duration) -> NbdrootResult<()>;
}

/// `ping` for echo, a plain socket for the port check.
pub struct CommandProbe {
    ping: PathBuf,
}

impl CommandProbe {
    pub fn new(ping: impl Into<PathBuf>) -> Self {
        Self { ping: ping.into() }
    }
}

fn unreachable(host: &str, reason: impl Into<String>) -> NbdrootError {
    NbdrootError::ConnectivityUnreachable {
        host: host.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl ReachabilityProbe for CommandProbe {
    async fn echo(&self, host: &str, timeout: Duration) -> NbdrootResult<()> {
        let secs = timeout.as_secs().max(1);
        let mut command = tokio::process::Command::new(&self.ping);
        command
            .args(["-c", "1", "-W", secs.to_string().as_str(), host])
            .kill_on_drop(true);

        // ping's own -W bounds the reply wait, not name resolution
        let output = tokio::time::timeout(timeout + Duration::from_secs(1), command.output())
            .await
            .map_err(|_| unreachable(host, format!("no echo reply within {}s", secs)))?
            .map_err(|e| unreachable(host, format!("Failed to run {}: {}", self.ping.display(), e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(unreachable(host, format!("no echo reply ({})", output.status)))
        }
    }

    async fn connect(&self, target: &RemoteTarget, timeout: Duration) -> NbdrootResult<()> {
        let addr = target.connect_addr();
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(unreachable(target.host(), format!("tcp {}: {}", addr, e))),
            Err(_) => Err(unreachable(
                target.host(),
                format!("tcp {}: no answer within {}s", addr, timeout.as_secs()),
            )),
        }
    }
}

/// Runs the echo and port checks and logs what they found.
pub struct ConnectivityProbe<'a> {
    probe: &'a dyn ReachabilityProbe,
    timeout: Duration,
}

impl<'a> ConnectivityProbe<'a> {
    pub fn new(probe: &'a dyn ReachabilityProbe, timeout: Duration) -> Self {
        Self { probe, timeout }
    }

    /// `Advisory` only when neither check gets through.
    pub async fn check(&self, target: &RemoteTarget, diag: &mut Diagnostics) -> StageOutcome<()> {
        let echo = self.probe.echo(target.host(), self.timeout).await;
        match &echo {
            Ok(()) => diag.info(Stage::Probe, format!("{} answers echo", target.host())),
            Err(e) => diag.info(Stage::Probe, e.to_string()),
        }

        match self.probe.connect(target, self.timeout).await {
            Ok(()) => {
                diag.info(Stage::Probe, format!("{} accepts connections", target));
                StageOutcome::Ok(())
            }
            Err(e) => match echo {
                Ok(()) => {
                    diag.info(Stage::Probe, e.to_string());
                    StageOutcome::Ok(())
                }
                Err(_) => StageOutcome::Advisory((), e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Severity;

    struct Fixed {
        echo: bool,
        tcp: bool,
    }

    #[async_trait]
    impl ReachabilityProbe for Fixed {
        async fn echo(&self, host: &str, _timeout: Duration) -> NbdrootResult<()> {
            if self.echo {
                Ok(())
            } else {
                Err(unreachable(host, "no echo reply"))
            }
        }

        async fn connect(&self, target: &RemoteTarget, _timeout: Duration) -> NbdrootResult<()> {
            if self.tcp {
                Ok(())
            } else {
                Err(unreachable(target.host(), "connection refused"))
            }
        }
    }

    fn target() -> RemoteTarget {
        RemoteTarget::parse("10.0.0.5:10809").unwrap()
    }

    #[tokio::test]
    async fn test_filtered_icmp_is_not_advisory() {
        let probe = Fixed {
            echo: false,
            tcp: true,
        };
        let mut diag = Diagnostics::default();
        let outcome = ConnectivityProbe::new(&probe, Duration::from_secs(3))
            .check(&target(), &mut diag)
            .await;

        assert!(matches!(outcome, StageOutcome::Ok(())));
        assert_eq!(diag.count(Severity::Info), 2);
    }

    #[tokio::test]
    async fn test_both_fail_is_advisory() {
        let probe = Fixed {
            echo: false,
            tcp: false,
        };
        let mut diag = Diagnostics::default();
        let outcome = ConnectivityProbe::new(&probe, Duration::from_secs(3))
            .check(&target(), &mut diag)
            .await;

        assert!(matches!(
            outcome,
            StageOutcome::Advisory((), NbdrootError::ConnectivityUnreachable { .. })
        ));
        assert!(!outcome.is_fatal());
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = RemoteTarget::parse(&format!("127.0.0.1:{}", port)).unwrap();

        let probe = CommandProbe::new("ping");
        assert!(probe.connect(&target, Duration::from_secs(3)).await.is_ok());

        drop(listener);
        assert!(probe.connect(&target, Duration::from_secs(3)).await.is_err());
    }
}
