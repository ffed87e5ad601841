//! The process-handle contract.

use async_trait::async_trait;
use shepherd_common::{ExitStatus, Result, Signal};

/// One OS process under observation.
///
/// A handle is either backed by a child we spawned (exit observed through
/// `wait(2)`) or by an attached pid (exit synthesized by polling). `wait()`
/// may be awaited by any number of callers; every call resolves with the
/// same status once the process is gone.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;

    /// Whether the process has not been observed to exit yet.
    fn alive(&self) -> bool;

    /// Deliver a signal to the process.
    fn kill(&self, signal: Signal) -> Result<()>;

    /// Resolve with the process outcome; immediately if already exited.
    async fn wait(&self) -> ExitStatus;
}
