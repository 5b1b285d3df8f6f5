//! Attach a network block device as the root filesystem during early boot.
//!
//! [`sequence::BootSequence`] runs the stages in order against a
//! [`sequence::Host`], the set of OS primitives. `Host::linux` is the real
//! system; tests substitute in-memory fakes.

#[cfg(target_os = "linux")]
pub mod cmdline;
#[cfg(target_os = "linux")]
pub mod config;
#[cfg(target_os = "linux")]
pub mod device;
#[cfg(target_os = "linux")]
pub mod kmod;
#[cfg(target_os = "linux")]
pub mod logging;
#[cfg(target_os = "linux")]
pub mod network;
#[cfg(target_os = "linux")]
pub mod outcome;
#[cfg(target_os = "linux")]
pub mod probe;
#[cfg(target_os = "linux")]
pub mod report;
#[cfg(target_os = "linux")]
pub mod sequence;
#[cfg(target_os = "linux")]
pub mod session;
#[cfg(target_os = "linux")]
pub mod state;
#[cfg(target_os = "linux")]
pub mod verify;
