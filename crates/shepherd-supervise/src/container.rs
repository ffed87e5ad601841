//! Process transport and container seams.
//!
//! The supervisor talks to a launched application through two interfaces: a
//! [`ProcessTransport`] that knows how to spawn, attach to and connect to
//! processes, and a [`Container`] that represents the control channel into
//! one running application. Both are traits so tests can script every
//! launch outcome.

use async_trait::async_trait;
use shepherd_common::{Error, ExitStatus, Result, Signal, WorkerId};
use shepherd_process::{ProcessHandle, RemoteProcess, SpawnedProcess};
use shepherd_store::AppConfig;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A worker of a cluster application, as reported by its container.
#[derive(Debug, Clone, Copy)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: u32,
    pub alive: bool,
}

/// Exit notice for one cluster worker.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub id: WorkerId,
    pub pid: u32,
    pub status: ExitStatus,
}

/// Control channel into one running application.
#[async_trait]
pub trait Container: Send + Sync {
    /// Ask the container to run the application's entry point. Resolves once
    /// the application code is up.
    async fn start(&self) -> Result<()>;

    /// Liveness check over the control channel.
    async fn ping(&self) -> Result<()>;

    /// Ask the application to wind down on its own terms. Resolution does
    /// not imply the process has exited.
    async fn initiate_graceful_shutdown(&self) -> Result<()>;

    /// Fork one worker with the given id.
    async fn spawn_worker(&self, id: WorkerId) -> Result<WorkerInfo>;

    /// Forget a dead worker's bookkeeping inside the container.
    async fn drop_worker(&self, id: WorkerId) -> Result<()>;

    /// Force-kill one worker.
    async fn kill_worker(&self, id: WorkerId) -> Result<()>;

    /// Snapshot of all workers the container knows about.
    async fn workers(&self) -> Result<Vec<WorkerInfo>>;

    /// Stream of worker exits. The channel closes when the container goes
    /// away.
    fn subscribe_worker_exits(&self) -> mpsc::UnboundedReceiver<WorkerExit>;

    /// Flips to `true` when the control channel drops.
    fn closed(&self) -> watch::Receiver<bool>;
}

/// Factory for process handles and container connections.
#[async_trait]
pub trait ProcessTransport: Send + Sync {
    /// Spawn the application's OS process.
    async fn spawn(&self, config: &AppConfig) -> Result<Arc<dyn ProcessHandle>>;

    /// Open the control channel into the process with the given pid.
    async fn connect(&self, config: &AppConfig, pid: u32) -> Result<Arc<dyn Container>>;

    /// Handle over a process that was not spawned in this supervisor
    /// lifetime. With `closed` set, the process is bound to that peer
    /// connection and killed when it drops.
    fn attach(&self, pid: u32, closed: Option<watch::Receiver<bool>>) -> Arc<dyn ProcessHandle>;
}

/// [`ProcessTransport`] over plain OS processes.
///
/// Spawns through [`SpawnedProcess`] with stdio appended to the configured
/// sink files, and hands out a [`LocalContainer`] whose control surface is
/// signal-based: no in-process RPC, so worker operations are unsupported.
#[derive(Default)]
pub struct OsTransport;

impl OsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessTransport for OsTransport {
    async fn spawn(&self, config: &AppConfig) -> Result<Arc<dyn ProcessHandle>> {
        tokio::fs::create_dir_all(&config.storage).await?;
        let stdout = sink_file(&config.stdout)?;
        let stderr = sink_file(&config.stderr)?;
        let mut args = vec![config.path.display().to_string()];
        args.extend(config.args.iter().cloned());
        let child = SpawnedProcess::spawn(
            &config.interpreter,
            &args,
            &config.env,
            stdout,
            stderr,
            config.path.parent(),
        )?;
        Ok(Arc::new(child))
    }

    async fn connect(&self, _config: &AppConfig, pid: u32) -> Result<Arc<dyn Container>> {
        Ok(Arc::new(LocalContainer::new(pid)))
    }

    fn attach(&self, pid: u32, closed: Option<watch::Receiver<bool>>) -> Arc<dyn ProcessHandle> {
        match closed {
            Some(closed) => Arc::new(RemoteProcess::with_disconnect(pid, closed)),
            None => Arc::new(RemoteProcess::new(pid)),
        }
    }
}

fn sink_file(path: &std::path::Path) -> Result<std::fs::File> {
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

/// Signal-based [`Container`] for processes without a control channel.
///
/// Graceful shutdown is a SIGTERM; pings probe the pid; cluster operations
/// are rejected because there is nobody on the other side to fork workers.
pub struct LocalContainer {
    pid: u32,
    closed_rx: watch::Receiver<bool>,
    // Keeps the channel open for the process's lifetime.
    _closed_tx: watch::Sender<bool>,
}

impl LocalContainer {
    pub fn new(pid: u32) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            pid,
            closed_rx,
            _closed_tx: closed_tx,
        }
    }
}

#[async_trait]
impl Container for LocalContainer {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if shepherd_process::pid_alive(self.pid)? {
            Ok(())
        } else {
            Err(Error::disconnected(format!("pid {} is gone", self.pid)))
        }
    }

    async fn initiate_graceful_shutdown(&self) -> Result<()> {
        shepherd_process::send_signal(self.pid, Signal::Term)
    }

    async fn spawn_worker(&self, _id: WorkerId) -> Result<WorkerInfo> {
        Err(Error::unsupported("worker forking over a signal-only container"))
    }

    async fn drop_worker(&self, _id: WorkerId) -> Result<()> {
        Err(Error::unsupported("worker forking over a signal-only container"))
    }

    async fn kill_worker(&self, _id: WorkerId) -> Result<()> {
        Err(Error::unsupported("worker forking over a signal-only container"))
    }

    async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        Ok(Vec::new())
    }

    fn subscribe_worker_exits(&self) -> mpsc::UnboundedReceiver<WorkerExit> {
        // No workers will ever exit; hand out a closed channel.
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}
