//! OS-level process primitives.
//!
//! Everything above this crate talks about processes through the
//! [`ProcessHandle`] trait; this crate provides the two concrete kinds:
//! a [`SpawnedProcess`] we forked ourselves and a [`RemoteProcess`] we only
//! attached to and must watch from the outside.

mod check;
mod handle;
mod remote;
mod spawn;

pub use check::pid_alive;
pub use handle::ProcessHandle;
pub use remote::{RemoteProcess, POLL_INTERVAL};
pub use spawn::{send_signal, SpawnedProcess};
