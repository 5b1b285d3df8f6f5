//! nbdroot shared types.
//!
//! Types and constants used by both the early-boot binary (`nbdroot`) and the
//! in-memory fakes in `nbdroot-test-utils`.

pub mod attempt;
pub mod constants;
pub mod errors;
pub mod layout;
pub mod target;

pub use attempt::{AttemptOutcome, ConnectionAttempt, Variant};
pub use errors::{NbdrootError, NbdrootResult};
pub use layout::StateFile;
pub use target::RemoteTarget;
