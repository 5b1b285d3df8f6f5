//! Command-line and environment configuration.

use clap::{Args, Parser, Subcommand};
use nbdroot_shared::constants::{cmdline, device, kmod, nbd, paths, timing, verify};
use std::path::PathBuf;
use std::time::Duration;

/// nbdroot - attach a network block device as the root filesystem
#[derive(Parser, Debug)]
#[command(author, version, about = "Attach an NBD export as the root device from the initramfs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: BootConfig,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Parse the command line and attach the device in one pass (default)
    Run,
    /// Only parse the command line and record the target for a later hook
    ParseCmdline,
    /// Attach the device for the target recorded by `parse-cmdline`
    Connect,
}

#[derive(Args, Debug, Clone)]
pub struct BootConfig {
    /// Kernel command line source
    #[arg(long, global = true, env = "NBDROOT_CMDLINE", default_value = cmdline::PATH)]
    pub cmdline_path: PathBuf,

    /// Transient file handing the target to later boot hooks
    #[arg(long, global = true, env = "NBDROOT_STATE_FILE", default_value = paths::STATE_FILE)]
    pub state_file: PathBuf,

    /// Block special file the export is attached to
    #[arg(long, global = true, env = "NBDROOT_DEVICE", default_value = device::PATH)]
    pub device: PathBuf,

    /// Number of NBD units the driver creates
    #[arg(long, global = true, env = "NBDROOT_NBDS_MAX", default_value_t = kmod::NBDS_MAX)]
    pub nbds_max: u32,

    /// Partitions per NBD unit
    #[arg(long, global = true, env = "NBDROOT_MAX_PART", default_value_t = kmod::MAX_PART)]
    pub max_part: u32,

    /// Export requested by the named-export variant (empty: server default)
    #[arg(long, global = true, env = "NBDROOT_EXPORT_NAME", default_value = nbd::DEFAULT_EXPORT)]
    pub export_name: String,

    /// Upper bound on waiting for an address and a default route
    #[arg(long, global = true, env = "NBDROOT_NETWORK_TIMEOUT_SECS", default_value_t = timing::NETWORK_TIMEOUT_SECS)]
    pub network_timeout_secs: u64,

    #[arg(long, global = true, env = "NBDROOT_NETWORK_POLL_MS", default_value_t = timing::NETWORK_POLL_MS)]
    pub network_poll_ms: u64,

    /// Fail the boot when the network is not ready by the deadline
    #[arg(long, global = true, env = "NBDROOT_REQUIRE_NETWORK")]
    pub require_network: bool,

    #[arg(long, global = true, env = "NBDROOT_PROBE_TIMEOUT_SECS", default_value_t = timing::PROBE_TIMEOUT_SECS)]
    pub probe_timeout_secs: u64,

    /// Delay between the handshake and the first read
    #[arg(long, global = true, env = "NBDROOT_SETTLE_MS", default_value_t = timing::SETTLE_MS)]
    pub settle_ms: u64,

    #[arg(long, global = true, env = "NBDROOT_READ_SIZE", default_value_t = verify::READ_SIZE)]
    pub read_size: usize,

    #[arg(long, global = true, env = "NBDROOT_READ_TIMEOUT_SECS", default_value_t = timing::READ_TIMEOUT_SECS)]
    pub read_timeout_secs: u64,

    /// Kernel message buffer the diagnostics are written to
    #[arg(long, global = true, env = "NBDROOT_KMSG", default_value = paths::KMSG)]
    pub kmsg_path: PathBuf,

    /// Also write the outcome as JSON to this file
    #[arg(long, global = true, env = "NBDROOT_REPORT_FILE")]
    pub report_file: Option<PathBuf>,

    #[arg(long, global = true, env = "NBDROOT_MODPROBE", default_value = "modprobe")]
    pub modprobe: PathBuf,

    #[arg(long, global = true, env = "NBDROOT_NBD_CLIENT", default_value = "nbd-client")]
    pub nbd_client: PathBuf,

    #[arg(long, global = true, env = "NBDROOT_PING", default_value = "ping")]
    pub ping: PathBuf,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            cmdline_path: PathBuf::from(cmdline::PATH),
            state_file: PathBuf::from(paths::STATE_FILE),
            device: PathBuf::from(device::PATH),
            nbds_max: kmod::NBDS_MAX,
            max_part: kmod::MAX_PART,
            export_name: nbd::DEFAULT_EXPORT.to_string(),
            network_timeout_secs: timing::NETWORK_TIMEOUT_SECS,
            network_poll_ms: timing::NETWORK_POLL_MS,
            require_network: false,
            probe_timeout_secs: timing::PROBE_TIMEOUT_SECS,
            settle_ms: timing::SETTLE_MS,
            read_size: verify::READ_SIZE,
            read_timeout_secs: timing::READ_TIMEOUT_SECS,
            kmsg_path: PathBuf::from(paths::KMSG),
            report_file: None,
            modprobe: PathBuf::from("modprobe"),
            nbd_client: PathBuf::from("nbd-client"),
            ping: PathBuf::from("ping"),
        }
    }
}

impl BootConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    /// Poll interval, never zero.
    pub fn network_poll(&self) -> Duration {
        Duration::from_millis(self.network_poll_ms.max(1))
    }

    /// Bytes read from the device head, never zero.
    pub fn read_size(&self) -> usize {
        self.read_size.max(1)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let cli = Cli::try_parse_from(["nbdroot"]).unwrap();
        assert_eq!(cli.command, None);

        let parsed = cli.config;
        let default = BootConfig::default();
        assert_eq!(parsed.device, default.device);
        assert_eq!(parsed.state_file, default.state_file);
        assert_eq!(parsed.nbds_max, 16);
        assert_eq!(parsed.export_name, "");
        assert_eq!(parsed.network_timeout(), Duration::from_secs(30));
        assert_eq!(parsed.settle(), Duration::from_millis(2000));
        assert!(!parsed.require_network);
        assert!(parsed.report_file.is_none());
    }

    #[test]
    fn test_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "nbdroot",
            "connect",
            "--state-file",
            "/tmp/target",
            "--require-network",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Command::Connect));
        assert_eq!(cli.config.state_file, PathBuf::from("/tmp/target"));
        assert!(cli.config.require_network);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = BootConfig {
            network_poll_ms: 0,
            ..BootConfig::default()
        };
        assert_eq!(config.network_poll(), Duration::from_millis(1));
    }

    #[test]
    fn test_zero_read_size_is_clamped() {
        let cli = Cli::try_parse_from(["nbdroot", "--read-size", "0"]).unwrap();
        assert_eq!(cli.config.read_size(), 1);
    }
}
