//! Network block device kernel driver.
//!
//! Loads `nbd` with a fixed unit and partition count. A driver that cannot be
//! loaded is fatal and never retried: a module missing from the running
//! kernel will not appear on a second try.

use async_trait::async_trait;
use nbdroot_shared::errors::{NbdrootError, NbdrootResult};
use std::path::PathBuf;

use crate::outcome::{Stage, StageOutcome};
use crate::report::Diagnostics;

/// Driver sizing passed on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleParams {
    /// Number of /dev/nbdX units (N)
    pub nbds_max: u32,
    /// Partitions per unit (M)
    pub max_part: u32,
}

impl ModuleParams {
    /// `key=value` arguments for modprobe.
    pub fn args(&self) -> Vec<String> {
        vec![
            format!("nbds_max={}", self.nbds_max),
            format!("max_part={}", self.max_part),
        ]
    }
}

/// Whether the driver is present, as observed in the module registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelModuleState {
    pub present: bool,
    /// Loaded by this run rather than already present.
    pub loaded_now: bool,
}

/// OS module registry.
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    /// Whether `name` is loaded or built into the kernel.
    async fn is_loaded(&self, name: &str) -> NbdrootResult<bool>;

    /// Load `name` with the given parameters.
    async fn load(&self, name: &str, params: &ModuleParams) -> NbdrootResult<()>;
}

/// Registry backed by `/proc/modules`, `/sys/module` and `modprobe`.
pub struct LinuxModules {
    modprobe: PathBuf,
    sys_module: PathBuf,
}

impl LinuxModules {
    pub fn new(modprobe: impl Into<PathBuf>) -> Self {
        Self {
            modprobe: modprobe.into(),
            sys_module: PathBuf::from("/sys/module"),
        }
    }
}

#[async_trait]
impl ModuleRegistry for LinuxModules {
    async fn is_loaded(&self, name: &str) -> NbdrootResult<bool> {
        let modules = procfs::modules().map_err(|e| {
            NbdrootError::Internal(format!("Failed to read /proc/modules: {}", e))
        })?;
        if modules.contains_key(name) {
            return Ok(true);
        }

        // Built-in drivers have no /proc/modules entry but still show up here
        Ok(self.sys_module.join(name).is_dir())
    }

    async fn load(&self, name: &str, params: &ModuleParams) -> NbdrootResult<()> {
        let output = tokio::process::Command::new(&self.modprobe)
            .arg(name)
            .args(params.args())
            .output()
            .await
            .map_err(|e| {
                NbdrootError::module_load(
                    name,
                    format!("Failed to run {}: {}", self.modprobe.display(), e),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = match stderr.trim() {
                "" => format!("{} exited with {}", self.modprobe.display(), output.status),
                msg => msg.to_string(),
            };
            return Err(NbdrootError::module_load(name, reason));
        }

        Ok(())
    }
}

/// Ensures the driver is loaded.
pub struct ModuleProvisioner<'a> {
    registry: &'a dyn ModuleRegistry,
    name: &'a str,
    params: ModuleParams,
}

impl<'a> ModuleProvisioner<'a> {
    pub fn new(registry: &'a dyn ModuleRegistry, name: &'a str, params: ModuleParams) -> Self {
        Self {
            registry,
            name,
            params,
        }
    }

    /// Load the driver unless it is already present.
    ///
    /// Already present is success without touching the registry again, so
    /// calling this twice leaves the same state as calling it once.
    pub async fn ensure_loaded(&self, diag: &mut Diagnostics) -> StageOutcome<KernelModuleState> {
        match self.registry.is_loaded(self.name).await {
            Ok(true) => {
                diag.info(Stage::Module, format!("{} driver already present", self.name));
                return StageOutcome::Ok(KernelModuleState {
                    present: true,
                    loaded_now: false,
                });
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("Cannot inspect module registry, loading anyway: {}", e),
        }

        if let Err(e) = self.registry.load(self.name, &self.params).await {
            return StageOutcome::Fatal(e);
        }

        match self.registry.is_loaded(self.name).await {
            Ok(false) => StageOutcome::Fatal(NbdrootError::module_load(
                self.name,
                "load reported success but the driver is not registered",
            )),
            // Load succeeded; an unreadable registry is not a reason to fail
            Ok(true) | Err(_) => {
                diag.info(
                    Stage::Module,
                    format!("loaded {} ({})", self.name, self.params.args().join(" ")),
                );
                StageOutcome::Ok(KernelModuleState {
                    present: true,
                    loaded_now: true,
                })
            }
        }
    }
}
