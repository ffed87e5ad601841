//! Handles for processes that were not spawned by this supervisor.
//!
//! A remote process cannot be waited on through the OS, so liveness is
//! observed by polling the pid and the exit status is synthesized when the
//! process disappears.

use crate::check::pid_alive;
use crate::handle::ProcessHandle;
use crate::spawn::send_signal;
use async_trait::async_trait;
use shepherd_common::{ExitStatus, Result, Signal};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// How often an attached pid is probed for liveness.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A handle over a process attached by pid.
///
/// Since the real exit status is unobservable, [`ProcessHandle::wait`]
/// resolves with a synthetic `code -1 / signal UNKNOWN` status once the pid
/// stops answering.
pub struct RemoteProcess {
    pid: u32,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl RemoteProcess {
    /// Attach to a running pid and start watching it.
    pub fn new(pid: u32) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            poll_until_dead(pid).await;
            debug!(pid, "attached process disappeared");
            let _ = exit_tx.send(Some(ExitStatus::unknown()));
        });
        Self { pid, exit_rx }
    }

    /// Attach to a pid whose lifetime is bound to a peer connection.
    ///
    /// When `closed` flips to `true` the process is force-killed before the
    /// normal death poll runs, so a dropped connection never leaves the
    /// process orphaned.
    pub fn with_disconnect(pid: u32, mut closed: watch::Receiver<bool>) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let disconnected = async {
                loop {
                    if *closed.borrow_and_update() {
                        return;
                    }
                    if closed.changed().await.is_err() {
                        return;
                    }
                }
            };
            tokio::select! {
                _ = disconnected => {
                    if pid_alive(pid).unwrap_or(false) {
                        debug!(pid, "peer disconnected, killing attached process");
                        let _ = send_signal(pid, Signal::Kill);
                    }
                    poll_until_dead(pid).await;
                }
                _ = poll_until_dead(pid) => {}
            }
            debug!(pid, "attached process disappeared");
            let _ = exit_tx.send(Some(ExitStatus::unknown()));
        });
        Self { pid, exit_rx }
    }
}

async fn poll_until_dead(pid: u32) {
    loop {
        match pid_alive(pid) {
            Ok(true) => tokio::time::sleep(POLL_INTERVAL).await,
            Ok(false) | Err(_) => return,
        }
    }
}

#[async_trait]
impl ProcessHandle for RemoteProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    fn kill(&self, signal: Signal) -> Result<()> {
        send_signal(self.pid, signal)
    }

    async fn wait(&self) -> ExitStatus {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(status) = rx.borrow_and_update().clone() {
                return status;
            }
            if rx.changed().await.is_err() {
                return ExitStatus::unknown();
            }
        }
    }
}
