//! Application orchestration: registration, starts with a bounded restart
//! policy, stops, cluster operations and resurrection of processes that
//! outlived the previous supervisor run.

mod events;
mod ops;
mod types;

pub use types::{AppListEntry, ManagerState, UsageReport, WorkerStatus};

use crate::config::SupervisorOptions;
use crate::container::ProcessTransport;
use crate::main_process::MainProcess;
use crate::process::Process;
use shepherd_common::{AppId, Error, ExitStatus, IdGenerator, Result, Signal};
use shepherd_metrics::{SystemProbe, UsageProvider};
use shepherd_state::{AppMeta, AppState};
use shepherd_store::{AppConfig, ConfigStore, RuntimeRecord, RuntimeStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A started application: one plain process or one cluster main process.
pub enum AppProcess {
    Single(Process),
    Cluster(MainProcess),
}

impl AppProcess {
    pub fn process(&self) -> &Process {
        match self {
            AppProcess::Single(p) => p,
            AppProcess::Cluster(mp) => mp.process(),
        }
    }

    pub fn as_cluster(&self) -> Option<&MainProcess> {
        match self {
            AppProcess::Single(_) => None,
            AppProcess::Cluster(mp) => Some(mp),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process().pid()
    }

    pub fn alive(&self) -> bool {
        self.process().alive()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.process().exit_watch()
    }

    pub async fn exit(&self, options: crate::config::StopOptions) -> Result<()> {
        match self {
            AppProcess::Single(p) => p.exit(options).await,
            AppProcess::Cluster(mp) => mp.exit(options).await,
        }
    }
}

pub(crate) struct LiveApp {
    pub(crate) process: Arc<AppProcess>,
    pub(crate) record: RuntimeRecord,
}

#[derive(Default)]
pub(crate) struct AppsTable {
    /// Lifecycle records, created lazily, kept until the app is deleted.
    pub(crate) meta: HashMap<AppId, AppMeta>,
    /// Applications with a live (or just-launched) process.
    pub(crate) live: HashMap<AppId, LiveApp>,
}

pub(crate) struct ManagerInner {
    pub(crate) options: SupervisorOptions,
    pub(crate) configs: Arc<dyn ConfigStore>,
    pub(crate) runtime: Arc<dyn RuntimeStore>,
    pub(crate) transport: Arc<dyn ProcessTransport>,
    pub(crate) usage: UsageProvider,
    pub(crate) probe: Arc<dyn SystemProbe>,
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) apps: Mutex<AppsTable>,
    pub(crate) ids: IdGenerator,
}

/// The process manager. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ProcessManager {
    pub(crate) inner: Arc<ManagerInner>,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ProcessManager {
    /// Build a manager over the given stores and transport. The application
    /// id sequence resumes after the highest registered id.
    pub async fn new(
        options: SupervisorOptions,
        configs: Arc<dyn ConfigStore>,
        runtime: Arc<dyn RuntimeStore>,
        transport: Arc<dyn ProcessTransport>,
        probe: Arc<dyn SystemProbe>,
    ) -> Result<Self> {
        let next_id = configs
            .all()
            .await?
            .iter()
            .map(|c| c.id)
            .max()
            .map(|max| max + 1)
            .unwrap_or(1);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                options,
                configs,
                runtime,
                transport,
                usage: UsageProvider::new(probe.clone()),
                probe,
                state: Mutex::new(ManagerState::Created),
                apps: Mutex::new(AppsTable::default()),
                ids: IdGenerator::starting_at(next_id),
            }),
        })
    }

    /// Bring the manager up: resurrect survivors of the previous run and
    /// start every application marked for startup.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if *state == ManagerState::Running {
                return Err(Error::illegal_state("Has been already initialized"));
            }
            *state = ManagerState::Running;
        }
        info!("process manager initializing");
        self.resurrect().await
    }

    /// Wind the manager down. Supervised processes are left running and
    /// their runtime records kept, so a later [`resurrect`] re-attaches
    /// them.
    ///
    /// [`resurrect`]: ProcessManager::resurrect
    pub async fn uninitialize(&self) -> Result<()> {
        *self.lock_state() = ManagerState::Stopping;
        info!("process manager stopping, leaving applications running");
        *self.lock_state() = ManagerState::Stopped;
        Ok(())
    }

    pub fn state(&self) -> ManagerState {
        *self.lock_state()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_apps(&self) -> MutexGuard<'_, AppsTable> {
        self.inner.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recover applications that survived the previous supervisor run, in
    /// three phases: re-attach to still-running processes, start `startup`
    /// applications that are not running, and restart fallen `autorestart`
    /// applications. Safe to call repeatedly; already-attached or running
    /// applications are skipped.
    pub async fn resurrect(&self) -> Result<()> {
        let mut fallen: Vec<AppId> = Vec::new();

        for record in self.inner.runtime.all().await? {
            let id = record.id;
            let Some(config) = self.inner.configs.find_by_id(id).await? else {
                // Orphaned record, its application was deleted.
                self.inner.runtime.remove(id).await?;
                continue;
            };
            {
                let mut apps = self.lock_apps();
                let meta = apps.meta.entry(id).or_default();
                if meta.state().is_started() {
                    continue;
                }
                meta.enter(AppState::Attaching);
            }

            match self.probe_recorded_pid(&record).await {
                PidVerdict::Valid => match self.attach_app(&config, &record).await {
                    Ok(()) => {
                        info!(app = %config.name, pid = record.pid, "re-attached");
                        self.inner
                            .runtime
                            .mark_attached(id, now_ms())
                            .await?;
                    }
                    Err(err) => {
                        warn!(app = %config.name, pid = record.pid, error = %err,
                              "attach failed, killing the stray process");
                        self.lock_apps().meta.entry(id).or_default().enter(AppState::Stopped);
                        self.inner.runtime.remove(id).await?;
                        let stray = self.inner.transport.attach(record.pid, None);
                        let _ = stray.kill(Signal::Kill);
                        stray.wait().await;
                        fallen.push(id);
                    }
                },
                PidVerdict::Dead => {
                    debug!(app = %config.name, pid = record.pid, "recorded process is gone");
                    self.lock_apps().meta.entry(id).or_default().enter(AppState::Stopped);
                    self.inner.runtime.remove(id).await?;
                    fallen.push(id);
                }
                PidVerdict::Reused => {
                    // An unrelated process took the pid; never touch it.
                    warn!(app = %config.name, pid = record.pid,
                          "recorded pid belongs to a newer process, dropping the record");
                    self.lock_apps().meta.entry(id).or_default().enter(AppState::Stopped);
                    self.inner.runtime.remove(id).await?;
                    fallen.push(id);
                }
            }
        }

        for config in self.inner.configs.all().await? {
            let running = {
                let apps = self.lock_apps();
                apps.meta
                    .get(&config.id)
                    .map(|m| m.state().is_started())
                    .unwrap_or(false)
            };
            if running {
                continue;
            }
            let should_start =
                config.startup || (config.autorestart && fallen.contains(&config.id));
            if !should_start {
                continue;
            }
            if let Err(err) = self.start_app(config.clone(), false).await {
                warn!(app = %config.name, error = %err, "failed to start during resurrection");
            }
        }
        Ok(())
    }

    /// Check a recorded pid: still our process, exited, or reused by an
    /// unrelated one. A process that started after the recorded launch
    /// moment cannot be ours.
    async fn probe_recorded_pid(&self, record: &RuntimeRecord) -> PidVerdict {
        match self.inner.probe.times(record.pid).await {
            None => PidVerdict::Dead,
            Some(times) if times.start_time_ms > record.timestamps.started => PidVerdict::Reused,
            Some(_) => PidVerdict::Valid,
        }
    }

    async fn attach_app(&self, config: &AppConfig, record: &RuntimeRecord) -> Result<()> {
        let process = match config.mode {
            shepherd_store::AppMode::Single => {
                let p = Process::new(config.clone(), self.inner.transport.clone());
                p.attach(record.pid).await?;
                Arc::new(AppProcess::Single(p))
            }
            shepherd_store::AppMode::Cluster => {
                let mp = MainProcess::new(config.clone(), self.inner.transport.clone());
                mp.attach(record.pid).await?;
                Arc::new(AppProcess::Cluster(mp))
            }
        };
        let mut dead_workers = Vec::new();
        {
            let mut apps = self.lock_apps();
            let meta = apps.meta.entry(config.id).or_default();
            meta.note_running();
            if let Some(mp) = process.as_cluster() {
                for (wid, entry) in mp.workers() {
                    let worker = meta.worker_mut(wid);
                    if entry.alive {
                        worker.note_running();
                    } else {
                        worker.enter(AppState::Stopped);
                        dead_workers.push(wid);
                    }
                }
            }
            apps.live.insert(
                config.id,
                LiveApp {
                    process: process.clone(),
                    record: record.clone(),
                },
            );
        }
        self.watch_process_exit(config.id, process.clone());
        if let Some(mp) = process.as_cluster() {
            self.pump_cluster_events(config.id, mp);
        }
        // Workers that died while the supervisor was away go through the
        // usual per-worker restart policy.
        if config.autorestart {
            for wid in dead_workers {
                warn!(app = %config.name, worker = wid, "attached worker is down, restarting");
                let mgr = self.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    mgr.respawn_worker(config.id, wid, &config).await;
                });
            }
        }
        Ok(())
    }
}

enum PidVerdict {
    Valid,
    Dead,
    Reused,
}
