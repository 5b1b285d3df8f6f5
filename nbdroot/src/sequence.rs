//! The attach sequence.
//!
//! Stages run strictly in order, each one only after the previous one
//! settled:
//!
//! ```text
//! cmdline → module → device-node → network → probe → session → verify
//! ```
//!
//! The whole run is single-threaded and blocking from the boot framework's
//! point of view; the framework waits on the process exit status.

use nbdroot_shared::constants::cmdline::PARAM;
use nbdroot_shared::constants::device::{MAJOR, MINOR, MODE};
use nbdroot_shared::constants::kmod;
use nbdroot_shared::errors::NbdrootResult;
use nbdroot_shared::{ConnectionAttempt, RemoteTarget, StateFile, Variant};

use crate::cmdline::BootParameterParser;
use crate::config::BootConfig;
use crate::device::{DeviceNode, DeviceNodeProvisioner, DeviceNodes, LinuxDeviceNodes};
use crate::kmod::{LinuxModules, ModuleParams, ModuleProvisioner, ModuleRegistry};
use crate::network::{NetlinkObserver, NetworkObserver, NetworkReadinessWaiter};
use crate::outcome::Stage;
use crate::probe::{CommandProbe, ConnectivityProbe, ReachabilityProbe};
use crate::report::{BootOutcome, Diagnostics, OutcomeStatus};
use crate::session::{NbdClient, NbdTransport, SessionEstablisher};
use crate::state::{SessionState, StateMachine};
use crate::verify::{BlockReader, FileReader, ReadabilityVerifier};

/// OS primitives the sequence runs against.
pub struct Host {
    pub modules: Box<dyn ModuleRegistry>,
    pub nodes: Box<dyn DeviceNodes>,
    pub network: Box<dyn NetworkObserver>,
    pub probe: Box<dyn ReachabilityProbe>,
    pub transport: Box<dyn NbdTransport>,
    pub reader: Box<dyn BlockReader>,
}

impl Host {
    /// The real system, with helper binaries taken from `config`.
    pub fn linux(config: &BootConfig) -> Self {
        Self {
            modules: Box::new(LinuxModules::new(&config.modprobe)),
            nodes: Box::new(LinuxDeviceNodes),
            network: Box::new(NetlinkObserver),
            probe: Box::new(CommandProbe::new(&config.ping)),
            transport: Box::new(NbdClient::new(&config.nbd_client)),
            reader: Box::new(FileReader),
        }
    }
}

pub struct BootSequence<'a> {
    config: &'a BootConfig,
    host: &'a Host,
    state: StateFile,
}

impl<'a> BootSequence<'a> {
    pub fn new(config: &'a BootConfig, host: &'a Host) -> Self {
        Self {
            config,
            host,
            state: StateFile::new(&config.state_file),
        }
    }

    fn parser(&self) -> BootParameterParser<'_> {
        BootParameterParser::new(PARAM, &self.state)
    }

    /// Full run against the configured command line source.
    pub async fn run(&self) -> BootOutcome {
        let mut diag = Diagnostics::default();
        match BootParameterParser::read_cmdline(&self.config.cmdline_path, &mut diag) {
            Some(raw) => self.run_inner(&raw, diag).await,
            None => BootOutcome::skipped(diag),
        }
    }

    /// Full run against an already-read command line.
    pub async fn run_with_cmdline(&self, cmdline: &str) -> BootOutcome {
        self.run_inner(cmdline, Diagnostics::default()).await
    }

    async fn run_inner(&self, cmdline: &str, mut diag: Diagnostics) -> BootOutcome {
        match self.parser().parse(cmdline, &mut diag) {
            Some(target) => self.attach(&target, diag).await,
            None => BootOutcome::skipped(diag),
        }
    }

    /// Parse and record the target without attaching anything.
    pub fn parse_only(&self) -> BootOutcome {
        let mut diag = Diagnostics::default();
        let target = BootParameterParser::read_cmdline(&self.config.cmdline_path, &mut diag)
            .and_then(|raw| self.parser().parse(&raw, &mut diag));

        match target {
            Some(target) => {
                let mut outcome = BootOutcome::with_status(OutcomeStatus::Deferred, diag);
                outcome.target = Some(target.to_string());
                outcome
            }
            None => BootOutcome::skipped(diag),
        }
    }

    /// Attach the target recorded by an earlier [`Self::parse_only`].
    pub async fn run_from_state_file(&self) -> BootOutcome {
        let mut diag = Diagnostics::default();
        match self.parser().from_state(&mut diag) {
            Some(target) => self.attach(&target, diag).await,
            None => BootOutcome::skipped(diag),
        }
    }

    /// Run every stage after the command line for `target`.
    pub async fn attach(&self, target: &RemoteTarget, mut diag: Diagnostics) -> BootOutcome {
        let mut machine = StateMachine::new();
        let mut attempts = Vec::new();

        let result = self
            .attach_stages(target, &mut machine, &mut attempts, &mut diag)
            .await;

        if result.is_err() {
            machine.fail();
        }

        let status = match result {
            Ok(_) => OutcomeStatus::Succeeded,
            Err(_) => OutcomeStatus::Failed,
        };
        let mut outcome = BootOutcome::with_status(status, diag);
        outcome.target = Some(target.to_string());
        if let Ok(variant) = result {
            outcome.device = Some(self.config.device.clone());
            outcome.variant = Some(variant);
        }
        outcome.attempts = attempts;
        outcome.states = machine.trail().to_vec();
        outcome
    }

    async fn attach_stages(
        &self,
        target: &RemoteTarget,
        machine: &mut StateMachine,
        attempts: &mut Vec<ConnectionAttempt>,
        diag: &mut Diagnostics,
    ) -> NbdrootResult<Variant> {
        let config = self.config;
        let host = self.host;

        let params = ModuleParams {
            nbds_max: config.nbds_max,
            max_part: config.max_part,
        };
        ModuleProvisioner::new(host.modules.as_ref(), kmod::NAME, params)
            .ensure_loaded(diag)
            .await
            .settle(Stage::Module, diag)?;
        advance(machine, SessionState::ModulePresent, diag)?;

        let node = DeviceNode::new(&config.device, MAJOR, MINOR);
        DeviceNodeProvisioner::new(host.nodes.as_ref(), &node, MODE)
            .ensure(diag)
            .settle(Stage::DeviceNode, diag)?;
        advance(machine, SessionState::DeviceReady, diag)?;

        let network = NetworkReadinessWaiter::new(
            host.network.as_ref(),
            config.network_timeout(),
            config.network_poll(),
        )
        .wait(diag)
        .await;
        let network = if config.require_network {
            network.escalate()
        } else {
            network
        };
        network.settle(Stage::Network, diag)?;
        advance(machine, SessionState::NetworkReadyOrTimedOut, diag)?;

        ConnectivityProbe::new(host.probe.as_ref(), config.probe_timeout())
            .check(target, diag)
            .await
            .settle(Stage::Probe, diag)?;

        let report = SessionEstablisher::new(host.transport.as_ref(), &config.export_name)
            .establish(target, &config.device, machine, diag)
            .await;
        *attempts = report.attempts;
        let variant = report.outcome.settle(Stage::Session, diag)?;

        ReadabilityVerifier::new(
            host.reader.as_ref(),
            config.settle(),
            config.read_size(),
            config.read_timeout(),
        )
        .verify(&config.device, diag)
        .await
        .settle(Stage::Verify, diag)?;
        advance(machine, SessionState::Verified, diag)?;

        Ok(variant)
    }
}

/// Advance the machine; an illegal edge is reported like a fatal stage.
fn advance(
    machine: &mut StateMachine,
    next: SessionState,
    diag: &mut Diagnostics,
) -> NbdrootResult<()> {
    machine.advance(next).inspect_err(|e| diag.error(Stage::Outcome, e.to_string()))
}
