//! Shared constants.
//!
//! Defaults for every tunable in the boot sequence. The binary exposes each of
//! them as a CLI flag, so these are only the values used when nothing overrides them.

/// Kernel command line constants
pub mod cmdline {
    /// Boot parameter naming the remote export (`nbdroot=<host>:<port>`)
    pub const PARAM: &str = "nbdroot";

    /// Raw kernel command line
    pub const PATH: &str = "/proc/cmdline";
}

/// Network block device kernel driver
pub mod kmod {
    /// Module name as known to modprobe and /proc/modules
    pub const NAME: &str = "nbd";

    /// Number of /dev/nbdX units the driver creates (N)
    pub const NBDS_MAX: u32 = 16;

    /// Partitions per unit (M)
    pub const MAX_PART: u32 = 16;
}

/// Canonical device node for the first NBD unit
pub mod device {
    /// Block special file the remote volume is attached to
    pub const PATH: &str = "/dev/nbd0";

    /// Block major number registered by the nbd driver
    pub const MAJOR: u64 = 43;

    /// Minor number of unit 0
    pub const MINOR: u64 = 0;

    /// Permission bits applied to the node (rw for owner and group)
    pub const MODE: u32 = 0o660;
}

/// Well-known file locations
pub mod paths {
    /// Transient file holding the raw `<host>:<port>` for later boot hooks
    pub const STATE_FILE: &str = "/run/nbdroot/target";

    /// Kernel message buffer
    pub const KMSG: &str = "/dev/kmsg";
}

/// Deadlines and delays
pub mod timing {
    /// Upper bound on waiting for an address and a default route
    pub const NETWORK_TIMEOUT_SECS: u64 = 30;

    /// Interval between network state samples
    pub const NETWORK_POLL_MS: u64 = 500;

    /// Bound on each reachability check
    pub const PROBE_TIMEOUT_SECS: u64 = 3;

    /// Delay between a successful handshake and the readability check
    pub const SETTLE_MS: u64 = 2000;

    /// Bound on the readability check itself
    pub const READ_TIMEOUT_SECS: u64 = 10;
}

/// Readability check
pub mod verify {
    /// Bytes read from offset zero (one page, covers the partition table)
    pub const READ_SIZE: usize = 4096;
}

/// Diagnostic log
pub mod log {
    /// Prefix of every line written to the kernel message buffer
    pub const TAG: &str = "nbdroot";

    /// Longest kmsg record written, newline included; the kernel rejects
    /// oversized writes outright
    pub const KMSG_RECORD_MAX: usize = 976;

    /// Records written per run; userspace kmsg writes are rate limited to
    /// a burst of 10 by default
    pub const KMSG_BURST: usize = 10;
}

/// NBD protocol defaults
pub mod nbd {
    /// Export name sent by the primary variant; empty selects the server default
    pub const DEFAULT_EXPORT: &str = "";
}
