//! Block special file for the NBD unit.
//!
//! A minimal initramfs often has no `/dev/nbd0` even after the driver loads,
//! so the node is created explicitly. An existing node with the wrong type or
//! identity is reported, never deleted and recreated.

use nbdroot_shared::errors::NbdrootError;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

use crate::outcome::{Stage, StageOutcome};
use crate::report::Diagnostics;

/// Identity of the block special file that represents the remote volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceNode {
    pub path: PathBuf,
    pub major: u64,
    pub minor: u64,
}

impl DeviceNode {
    pub fn new(path: impl Into<PathBuf>, major: u64, minor: u64) -> Self {
        Self {
            path: path.into(),
            major,
            minor,
        }
    }
}

/// What currently sits at a node path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Block { major: u64, minor: u64, mode: u32 },
    /// Anything that is not a block device, with a human-readable type name.
    Other(&'static str),
}

/// OS device node namespace.
pub trait DeviceNodes: Send + Sync {
    /// `None` when nothing exists at `path`.
    fn inspect(&self, path: &Path) -> io::Result<Option<NodeKind>>;

    fn create_block(&self, node: &DeviceNode, mode: u32) -> io::Result<()>;

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
}

/// `lstat`/`mknod`/`chmod` on the real filesystem.
pub struct LinuxDeviceNodes;

impl DeviceNodes for LinuxDeviceNodes {
    fn inspect(&self, path: &Path) -> io::Result<Option<NodeKind>> {
        use nix::errno::Errno;
        use nix::sys::stat::{lstat, major, minor, SFlag};

        let stat = match lstat(path) {
            Ok(stat) => stat,
            Err(Errno::ENOENT) => return Ok(None),
            Err(e) => return Err(io::Error::from(e)),
        };

        let kind = SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits());
        let node = if kind == SFlag::S_IFBLK {
            NodeKind::Block {
                major: major(stat.st_rdev),
                minor: minor(stat.st_rdev),
                mode: stat.st_mode & 0o7777,
            }
        } else if kind == SFlag::S_IFREG {
            NodeKind::Other("regular file")
        } else if kind == SFlag::S_IFDIR {
            NodeKind::Other("directory")
        } else if kind == SFlag::S_IFCHR {
            NodeKind::Other("character device")
        } else if kind == SFlag::S_IFLNK {
            NodeKind::Other("symlink")
        } else {
            NodeKind::Other("special file")
        };

        Ok(Some(node))
    }

    fn create_block(&self, node: &DeviceNode, mode: u32) -> io::Result<()> {
        use nix::sys::stat::{makedev, mknod, Mode, SFlag};

        mknod(
            &node.path,
            SFlag::S_IFBLK,
            Mode::from_bits_truncate(mode),
            makedev(node.major, node.minor),
        )
        .map_err(io::Error::from)?;

        // mknod applies the umask
        self.set_mode(&node.path, mode)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
}

/// Ensures the canonical node exists with the canonical identity and mode.
pub struct DeviceNodeProvisioner<'a> {
    nodes: &'a dyn DeviceNodes,
    node: &'a DeviceNode,
    mode: u32,
}

impl<'a> DeviceNodeProvisioner<'a> {
    pub fn new(nodes: &'a dyn DeviceNodes, node: &'a DeviceNode, mode: u32) -> Self {
        Self { nodes, node, mode }
    }

    pub fn ensure(&self, diag: &mut Diagnostics) -> StageOutcome<()> {
        let path = &self.node.path;
        let unavailable = |reason: String| StageOutcome::Fatal(NbdrootError::device_node(path, reason));

        match self.nodes.inspect(path) {
            Err(e) => unavailable(format!("cannot inspect: {}", e)),

            Ok(None) => {
                if let Err(e) = self.nodes.create_block(self.node, self.mode) {
                    return unavailable(format!(
                        "missing and cannot be created as block {}:{}: {}",
                        self.node.major, self.node.minor, e
                    ));
                }
                diag.info(
                    Stage::DeviceNode,
                    format!(
                        "created {} (block {}:{}, mode {:o})",
                        path.display(),
                        self.node.major,
                        self.node.minor,
                        self.mode
                    ),
                );
                StageOutcome::Ok(())
            }

            Ok(Some(NodeKind::Block { major, minor, mode }))
                if major == self.node.major && minor == self.node.minor =>
            {
                if mode & 0o777 != self.mode & 0o777 {
                    if let Err(e) = self.nodes.set_mode(path, self.mode) {
                        return unavailable(format!(
                            "cannot set mode {:o} (currently {:o}): {}",
                            self.mode, mode, e
                        ));
                    }
                    tracing::debug!(path = %path.display(), "mode {:o} → {:o}", mode, self.mode);
                }
                diag.info(Stage::DeviceNode, format!("{} present", path.display()));
                StageOutcome::Ok(())
            }

            Ok(Some(NodeKind::Block { major, minor, .. })) => unavailable(format!(
                "is block {}:{}, expected {}:{}",
                major, minor, self.node.major, self.node.minor
            )),

            Ok(Some(NodeKind::Other(kind))) => {
                unavailable(format!("exists as a {}, not a block device", kind))
            }
        }
    }
}
