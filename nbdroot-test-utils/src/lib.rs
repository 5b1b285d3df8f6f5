//! In-memory OS primitives for driving the nbdroot sequence in tests.
//!
//! Every fake appends to one shared [`CallLog`], so a test can assert on the
//! order in which the sequence touched the system, not only on the outcome.

#![cfg(target_os = "linux")]

use async_trait::async_trait;
use nbdroot::config::BootConfig;
use nbdroot::device::{DeviceNode, DeviceNodes, NodeKind};
use nbdroot::kmod::{ModuleParams, ModuleRegistry};
use nbdroot::network::{NetworkObserver, NetworkState};
use nbdroot::probe::ReachabilityProbe;
use nbdroot::report::{DiagnosticSink, Severity};
use nbdroot::sequence::Host;
use nbdroot::session::{ConnectRequest, NbdTransport};
use nbdroot::verify::BlockReader;
use nbdroot_shared::errors::{NbdrootError, NbdrootResult};
use nbdroot_shared::{RemoteTarget, Variant};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// CALL LOG
// ============================================================================

/// Ordered record of every call made into the fakes.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Number of entries starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Entries starting with `prefix`, in call order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

// ============================================================================
// FAKES
// ============================================================================

pub struct FakeModules {
    loaded: Mutex<bool>,
    loadable: bool,
    log: CallLog,
}

#[async_trait]
impl ModuleRegistry for FakeModules {
    async fn is_loaded(&self, _name: &str) -> NbdrootResult<bool> {
        Ok(*self.loaded.lock())
    }

    async fn load(&self, name: &str, params: &ModuleParams) -> NbdrootResult<()> {
        self.log
            .push(format!("modprobe {} {}", name, params.args().join(" ")));
        if !self.loadable {
            return Err(NbdrootError::module_load(
                name,
                format!("Module {} not found in directory /lib/modules", name),
            ));
        }
        *self.loaded.lock() = true;
        Ok(())
    }
}

pub struct FakeNodes {
    node: Mutex<Option<NodeKind>>,
    read_only: bool,
    log: CallLog,
}

impl DeviceNodes for FakeNodes {
    fn inspect(&self, _path: &Path) -> io::Result<Option<NodeKind>> {
        Ok(self.node.lock().clone())
    }

    fn create_block(&self, node: &DeviceNode, mode: u32) -> io::Result<()> {
        self.log.push(format!(
            "mknod {} b {} {}",
            node.path.display(),
            node.major,
            node.minor
        ));
        if self.read_only {
            return Err(io::Error::from_raw_os_error(30));
        }
        *self.node.lock() = Some(NodeKind::Block {
            major: node.major,
            minor: node.minor,
            mode,
        });
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.log
            .push(format!("chmod {:o} {}", mode, path.display()));
        if let Some(NodeKind::Block { mode: m, .. }) = self.node.lock().as_mut() {
            *m = mode;
        }
        Ok(())
    }
}

/// Ready from the `ready_at`-th sample on (1-based); never when `None`.
pub struct FakeNetwork {
    ready_at: Option<usize>,
    samples: Mutex<usize>,
    log: CallLog,
}

#[async_trait]
impl NetworkObserver for FakeNetwork {
    async fn sample(&self) -> NbdrootResult<NetworkState> {
        let n = {
            let mut samples = self.samples.lock();
            *samples += 1;
            *samples
        };
        self.log.push("netlink sample");
        let ready = self.ready_at.is_some_and(|at| n >= at);
        Ok(NetworkState {
            has_global_address: ready,
            has_default_route: ready,
        })
    }
}

pub struct FakeProbe {
    echo: bool,
    tcp: bool,
    log: CallLog,
}

#[async_trait]
impl ReachabilityProbe for FakeProbe {
    async fn echo(&self, host: &str, _timeout: Duration) -> NbdrootResult<()> {
        self.log.push(format!("ping {}", host));
        if self.echo {
            Ok(())
        } else {
            Err(NbdrootError::ConnectivityUnreachable {
                host: host.to_string(),
                reason: "no echo reply".into(),
            })
        }
    }

    async fn connect(&self, target: &RemoteTarget, _timeout: Duration) -> NbdrootResult<()> {
        self.log.push(format!("tcp {}", target));
        if self.tcp {
            Ok(())
        } else {
            Err(NbdrootError::ConnectivityUnreachable {
                host: target.host().to_string(),
                reason: "connection refused".into(),
            })
        }
    }
}

pub struct FakeTransport {
    named: Result<(), String>,
    legacy: Result<(), String>,
    log: CallLog,
}

#[async_trait]
impl NbdTransport for FakeTransport {
    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<(), String> {
        self.log.push(format!(
            "nbd-client {} {} {} persist={}",
            request.variant,
            request.target,
            request.device.display(),
            request.persist
        ));
        match request.variant {
            Variant::WithExportName => self.named.clone(),
            Variant::Legacy => self.legacy.clone(),
        }
    }
}

/// Serves `data` for every read, or fails every read when `None`.
pub struct FakeReader {
    data: Option<Vec<u8>>,
    log: CallLog,
}

#[async_trait]
impl BlockReader for FakeReader {
    async fn read_head(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        self.log.push(format!("read {} {}", path.display(), len));
        match &self.data {
            Some(data) if data.len() >= len => Ok(data[..len].to_vec()),
            Some(_) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            None => Err(io::Error::from_raw_os_error(5)),
        }
    }
}

/// Sink that keeps every record it is given.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<(Severity, String)>>>);

impl MemorySink {
    pub fn records(&self) -> Vec<(Severity, String)> {
        self.0.lock().clone()
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&mut self, severity: Severity, line: &str) -> io::Result<()> {
        self.0.lock().push((severity, line.to_string()));
        Ok(())
    }
}

// ============================================================================
// HOST BUILDER
// ============================================================================

/// Builder for a [`Host`] made of fakes.
///
/// Defaults describe a healthy system: the driver loads, the node is missing
/// and creatable, the network is ready on the first sample, the server
/// answers both checks and accepts the named-export variant, and the device
/// serves non-zero data.
pub struct FakeHost {
    log: CallLog,
    module_present: bool,
    module_loadable: bool,
    node: Option<NodeKind>,
    read_only_dev: bool,
    network_ready_at: Option<usize>,
    echo: bool,
    tcp: bool,
    named: Result<(), String>,
    legacy: Result<(), String>,
    data: Option<Vec<u8>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            log: CallLog::default(),
            module_present: false,
            module_loadable: true,
            node: None,
            read_only_dev: false,
            network_ready_at: Some(1),
            echo: true,
            tcp: true,
            named: Ok(()),
            legacy: Ok(()),
            data: Some(vec![0xEB; 8192]),
        }
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn module_present(mut self) -> Self {
        self.module_present = true;
        self
    }

    pub fn module_missing(mut self) -> Self {
        self.module_loadable = false;
        self
    }

    pub fn existing_node(mut self, node: NodeKind) -> Self {
        self.node = Some(node);
        self
    }

    pub fn read_only_dev(mut self) -> Self {
        self.read_only_dev = true;
        self
    }

    pub fn network_ready_at(mut self, sample: Option<usize>) -> Self {
        self.network_ready_at = sample;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.echo = false;
        self.tcp = false;
        self
    }

    pub fn icmp_filtered(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn named_export(mut self, result: Result<(), &str>) -> Self {
        self.named = result.map_err(str::to_string);
        self
    }

    pub fn legacy(mut self, result: Result<(), &str>) -> Self {
        self.legacy = result.map_err(str::to_string);
        self
    }

    pub fn device_data(mut self, data: Option<Vec<u8>>) -> Self {
        self.data = data;
        self
    }

    pub fn build(self) -> Host {
        let log = self.log;
        Host {
            modules: Box::new(FakeModules {
                loaded: Mutex::new(self.module_present),
                loadable: self.module_loadable,
                log: log.clone(),
            }),
            nodes: Box::new(FakeNodes {
                node: Mutex::new(self.node),
                read_only: self.read_only_dev,
                log: log.clone(),
            }),
            network: Box::new(FakeNetwork {
                ready_at: self.network_ready_at,
                samples: Mutex::new(0),
                log: log.clone(),
            }),
            probe: Box::new(FakeProbe {
                echo: self.echo,
                tcp: self.tcp,
                log: log.clone(),
            }),
            transport: Box::new(FakeTransport {
                named: self.named,
                legacy: self.legacy,
                log: log.clone(),
            }),
            reader: Box::new(FakeReader {
                data: self.data,
                log,
            }),
        }
    }
}

// ============================================================================
// TEST CONTEXT
// ============================================================================

/// Config whose file paths all live in a private temp directory.
pub struct TestContext {
    pub config: BootConfig,
    pub dir: PathBuf,
    _temp_dir: TempDir, // Dropped after test
}

impl TestContext {
    pub fn new() -> io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().to_path_buf();
        let config = BootConfig {
            cmdline_path: dir.join("cmdline"),
            state_file: dir.join("run").join("nbdroot").join("target"),
            kmsg_path: dir.join("kmsg"),
            ..BootConfig::default()
        };
        Ok(Self {
            config,
            dir,
            _temp_dir: temp_dir,
        })
    }

    /// Write the kernel command line the sequence will read.
    pub fn write_cmdline(&self, cmdline: &str) -> io::Result<()> {
        std::fs::write(&self.config.cmdline_path, cmdline)
    }

    pub fn state_file_contents(&self) -> Option<String> {
        std::fs::read_to_string(&self.config.state_file).ok()
    }
}
