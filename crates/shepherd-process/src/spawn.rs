//! Spawning and signalling of directly owned child processes.

use crate::handle::ProcessHandle;
use async_trait::async_trait;
use shepherd_common::{Error, ExitStatus, Result, Signal};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

/// Deliver a signal to an arbitrary pid.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Hup => NixSignal::SIGHUP,
        Signal::Int => NixSignal::SIGINT,
        Signal::Quit => NixSignal::SIGQUIT,
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
        Signal::Usr1 => NixSignal::SIGUSR1,
        Signal::Usr2 => NixSignal::SIGUSR2,
    };
    kill(Pid::from_raw(pid as i32), sig)
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, signal: Signal) -> Result<()> {
    Err(Error::unsupported(format!(
        "sending {signal} on this platform"
    )))
}

/// A child process spawned and owned by this supervisor.
///
/// The `Child` itself is consumed by an internal reaper task; the handle
/// retains only the pid and a watch cell that the reaper fills exactly once
/// with the exit status.
pub struct SpawnedProcess {
    pid: u32,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl SpawnedProcess {
    /// Spawn `interpreter args...` detached from the supervisor's process
    /// group, with stdout/stderr appended to the given sink files and stdin
    /// closed.
    pub fn spawn(
        interpreter: &str,
        args: &[String],
        env: &HashMap<String, String>,
        stdout: std::fs::File,
        stderr: std::fs::File,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        let mut command = Command::new(interpreter);
        command
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::spawn_failed(interpreter, e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::spawn_failed(interpreter, "child exited before spawn returned"))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => convert_status(status),
                Err(e) => {
                    debug!(pid, error = %e, "wait on child failed");
                    ExitStatus::unknown()
                }
            };
            debug!(pid, %status, "child exited");
            let _ = exit_tx.send(Some(status));
        });

        Ok(Self { pid, exit_rx })
    }
}

fn convert_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::with_code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            let name = nix::sys::signal::Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| format!("SIG{sig}"));
            return ExitStatus::with_signal(name);
        }
    }
    ExitStatus::unknown()
}

#[async_trait]
impl ProcessHandle for SpawnedProcess {
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
                // Reaper gone without publishing; the process outcome is lost.
                return ExitStatus::unknown();
            }
        }
    }
}
