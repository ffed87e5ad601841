//! Main process of a cluster application.
//!
//! Wraps a [`Process`] and drives the worker set through the container:
//! spawning up to the configured instance count, scaling, rolling reloads
//! and per-worker kills. Worker exits are surfaced to the manager over a
//! channel.

use crate::config::StopOptions;
use crate::container::{Container, ProcessTransport, WorkerExit};
use crate::process::Process;
use shepherd_common::{Error, Result, Signal, WorkerId};
use shepherd_store::AppConfig;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Bookkeeping for one worker, kept after death for reporting.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub pid: u32,
    pub alive: bool,
    /// Epoch ms when the worker appeared.
    pub appeared: i64,
    /// Epoch ms when the worker was last seen dying.
    pub disappeared: Option<i64>,
}

pub struct MainProcess {
    proc: Process,
    workers: Arc<Mutex<BTreeMap<WorkerId, WorkerEntry>>>,
    events_tx: mpsc::UnboundedSender<WorkerExit>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerExit>>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl MainProcess {
    pub fn new(config: AppConfig, transport: Arc<dyn ProcessTransport>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            proc: Process::new(config, transport),
            workers: Arc::new(Mutex::new(BTreeMap::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn process(&self) -> &Process {
        &self.proc
    }

    pub fn config(&self) -> &AppConfig {
        self.proc.config()
    }

    pub fn pid(&self) -> Option<u32> {
        self.proc.pid()
    }

    fn lock_workers(&self) -> MutexGuard<'_, BTreeMap<WorkerId, WorkerEntry>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn container(&self) -> Result<Arc<dyn Container>> {
        self.proc
            .container()
            .ok_or_else(|| Error::illegal_state("No connection with the peer"))
    }

    /// Take the worker-exit stream; the manager wires it into its restart
    /// policy. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<WorkerExit>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Snapshot of the worker table.
    pub fn workers(&self) -> BTreeMap<WorkerId, WorkerEntry> {
        self.lock_workers().clone()
    }

    pub fn live_worker_ids(&self) -> Vec<WorkerId> {
        self.lock_workers()
            .iter()
            .filter(|(_, w)| w.alive)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn worker_pid(&self, id: WorkerId) -> Option<u32> {
        self.lock_workers()
            .get(&id)
            .filter(|w| w.alive)
            .map(|w| w.pid)
    }

    /// Start the main process and fork the initial worker set. Any worker
    /// spawn failure tears the whole cluster down.
    pub async fn start(&self) -> Result<()> {
        self.proc.start().await?;
        let container = self.container()?;
        self.pump_worker_exits(container.subscribe_worker_exits());

        for id in 0..self.config().instances {
            if let Err(err) = self.create_new_worker(Some(id)).await {
                let _ = self.proc.kill(Signal::Kill);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Re-attach to a running cluster and rebuild the worker table from the
    /// container's snapshot.
    pub async fn attach(&self, pid: u32) -> Result<()> {
        self.proc.attach(pid).await?;
        let container = self.container()?;
        let now = now_ms();
        {
            let mut workers = self.lock_workers();
            for info in container.workers().await? {
                workers.insert(
                    info.id,
                    WorkerEntry {
                        pid: info.pid,
                        alive: info.alive,
                        appeared: now,
                        disappeared: if info.alive { None } else { Some(now) },
                    },
                );
            }
        }
        self.pump_worker_exits(container.subscribe_worker_exits());
        Ok(())
    }

    /// Fork one worker. With no explicit id, the next free slot is used.
    pub async fn create_new_worker(&self, id: Option<WorkerId>) -> Result<WorkerId> {
        let id = id.unwrap_or_else(|| {
            let workers = self.lock_workers();
            (0..).find(|candidate| !workers.contains_key(candidate)).unwrap_or(0)
        });
        let container = self.container()?;
        let info = container.spawn_worker(id).await?;
        debug!(app = %self.config().name, worker = id, pid = info.pid, "worker spawned");
        self.lock_workers().insert(
            id,
            WorkerEntry {
                pid: info.pid,
                alive: true,
                appeared: now_ms(),
                disappeared: None,
            },
        );
        Ok(id)
    }

    /// Kill a worker (if still alive) and forget it on both sides.
    pub async fn delete_worker(&self, id: WorkerId) -> Result<()> {
        let alive = {
            let workers = self.lock_workers();
            let entry = workers
                .get(&id)
                .ok_or_else(|| Error::invalid_argument(format!("unknown worker {id}")))?;
            entry.alive
        };
        let container = self.container()?;
        if alive {
            container.kill_worker(id).await?;
        }
        container.drop_worker(id).await?;
        self.lock_workers().remove(&id);
        Ok(())
    }

    pub async fn kill_worker(&self, id: WorkerId) -> Result<()> {
        {
            let workers = self.lock_workers();
            if !workers.get(&id).map(|w| w.alive).unwrap_or(false) {
                return Err(Error::invalid_argument(format!(
                    "worker {id} is not running"
                )));
            }
        }
        self.container()?.kill_worker(id).await
    }

    /// Bring the worker set to exactly `instances` workers: excess workers
    /// are deleted highest id first, missing ones are forked into the lowest
    /// free slots.
    pub async fn scale(&self, instances: u32) -> Result<()> {
        let live: Vec<WorkerId> = self.live_worker_ids();
        let current = live.len() as u32;
        info!(app = %self.config().name, from = current, to = instances, "scaling");
        if current > instances {
            let excess = (current - instances) as usize;
            for id in live.into_iter().rev().take(excess) {
                self.delete_worker(id).await?;
            }
        } else {
            for _ in current..instances {
                self.create_new_worker(None).await?;
            }
        }
        Ok(())
    }

    /// Kill one worker and fork a replacement into the same slot.
    pub async fn restart_worker(&self, id: WorkerId) -> Result<()> {
        self.delete_worker(id).await?;
        self.create_new_worker(Some(id)).await?;
        Ok(())
    }

    /// Rolling restart of every live worker, one at a time, lowest id first.
    pub async fn reload(&self) -> Result<()> {
        for id in self.live_worker_ids() {
            self.restart_worker(id).await?;
        }
        Ok(())
    }

    /// Stop the cluster: delete all live workers, then bring down the main
    /// process. With the workers already gone the bare main process has
    /// nothing left to wind down, so it is killed outright.
    pub async fn exit(&self, _options: StopOptions) -> Result<()> {
        for id in self.live_worker_ids() {
            if let Err(err) = self.delete_worker(id).await {
                debug!(worker = id, error = %err, "failed to delete worker on exit");
            }
        }
        self.proc.exit(StopOptions::force()).await
    }

    fn pump_worker_exits(&self, mut exits: mpsc::UnboundedReceiver<WorkerExit>) {
        let events_tx = self.events_tx.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            while let Some(exit) = exits.recv().await {
                {
                    let mut workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(entry) = workers.get_mut(&exit.id) {
                        entry.alive = false;
                        entry.disappeared = Some(now_ms());
                    }
                }
                let _ = events_tx.send(exit);
            }
        });
    }
}
