//! Exit observation and the autorestart policy.
//!
//! Every launched or attached process gets a watcher task on its exit
//! channel; cluster main processes additionally pump their worker events
//! here. The restart budget is the pair of counters on the lifecycle
//! record: `restarts` only ever grows, `immediate_restarts` counts attempts
//! since the last confirmed healthy run and refills when `Running` is
//! reached again.

use super::{AppProcess, ProcessManager};
use crate::main_process::MainProcess;
use shepherd_common::{AppId, ExitStatus, WorkerId};
use shepherd_state::AppState;
use shepherd_store::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

impl ProcessManager {
    pub(crate) fn watch_process_exit(&self, id: AppId, process: Arc<AppProcess>) {
        let mgr = self.clone();
        let mut rx = process.exit_watch();
        tokio::spawn(async move {
            let status = loop {
                if let Some(status) = rx.borrow_and_update().clone() {
                    break status;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            };
            mgr.on_process_exit(id, status).await;
        });
    }

    pub(crate) fn pump_cluster_events(&self, id: AppId, main: &MainProcess) {
        let Some(mut events) = main.take_events() else {
            return;
        };
        let mgr = self.clone();
        tokio::spawn(async move {
            while let Some(exit) = events.recv().await {
                mgr.on_worker_exit(id, exit.id, exit.pid, exit.status).await;
            }
        });
    }

    async fn on_process_exit(&self, id: AppId, status: ExitStatus) {
        let stopping = self.state().is_stopping();
        let (prev, pid) = {
            let mut apps = self.lock_apps();
            let Some(meta) = apps.meta.get_mut(&id) else {
                return;
            };
            let prev = meta.state();
            if prev == AppState::Running {
                // A healthy run ended; the next crash gets a full budget.
                meta.immediate_restarts = 0;
            } else {
                meta.clear_starting_timer();
            }
            meta.enter(AppState::Stopped);
            let pid = apps.live.remove(&id).map(|live| live.record.pid);
            (prev, pid)
        };
        debug!(app = id, %status, from = %prev, "process exit observed");

        let _ = self.inner.runtime.remove(id).await;
        if let Some(pid) = pid {
            self.inner.usage.clear(pid);
        }
        if stopping {
            return;
        }

        let config = match self.inner.configs.find_by_id(id).await {
            Ok(Some(config)) => config,
            _ => return,
        };
        if !config.autorestart || !matches!(prev, AppState::Started | AppState::Running) {
            return;
        }

        let proceed = {
            let mut apps = self.lock_apps();
            let meta = apps.meta.entry(id).or_default();
            if meta.immediate_restarts >= config.max_restarts {
                meta.enter(AppState::Failed);
                false
            } else {
                meta.count_restart_attempt();
                meta.enter(AppState::WaitingForRestart);
                true
            }
        };
        if !proceed {
            warn!(app = %config.name, budget = config.max_restarts,
                  "restart budget exhausted, giving up");
            return;
        }

        tokio::time::sleep(Duration::from_millis(config.restart_delay_ms)).await;
        {
            let mut apps = self.lock_apps();
            let meta = apps.meta.entry(id).or_default();
            if meta.state() != AppState::WaitingForRestart {
                // A stop (or delete) superseded the pending restart.
                return;
            }
            meta.enter(AppState::Restarting);
        }
        if let Err(err) = self.start_app(config.clone(), true).await {
            warn!(app = %config.name, error = %err, "autorestart failed");
        }
    }

    async fn on_worker_exit(&self, id: AppId, worker: WorkerId, pid: u32, status: ExitStatus) {
        let stopping = self.state().is_stopping();
        let (app_state, prev) = {
            let mut apps = self.lock_apps();
            let Some(meta) = apps.meta.get_mut(&id) else {
                return;
            };
            let app_state = meta.state();
            let record = meta.worker_mut(worker);
            let prev = record.state();
            if prev == AppState::Running {
                record.immediate_restarts = 0;
            } else {
                record.clear_starting_timer();
            }
            record.enter(AppState::Stopped);
            (app_state, prev)
        };
        debug!(app = id, worker, %status, from = %prev, "worker exit observed");
        self.inner.usage.clear(pid);
        if stopping {
            return;
        }
        // Worker churn during cluster-level operations and deliberate
        // per-worker restarts is handled by the operation itself.
        if matches!(
            app_state,
            AppState::Stopping | AppState::Scaling | AppState::Reloading
        ) {
            return;
        }
        if matches!(prev, AppState::Restarting | AppState::Stopping) {
            return;
        }

        let config = match self.inner.configs.find_by_id(id).await {
            Ok(Some(config)) => config,
            _ => return,
        };
        if !config.autorestart || !matches!(prev, AppState::Started | AppState::Running) {
            return;
        }
        self.respawn_worker(id, worker, &config).await;
    }

    /// Bounded respawn loop for one worker slot of a live cluster. The
    /// worker's immediate budget gates every attempt, exactly as for whole
    /// processes.
    pub(crate) async fn respawn_worker(&self, id: AppId, worker: WorkerId, config: &AppConfig) {
        let Some(process) = ({
            let apps = self.lock_apps();
            apps.live.get(&id).map(|live| live.process.clone())
        }) else {
            return;
        };
        let Some(main) = process.as_cluster() else {
            return;
        };

        loop {
            let proceed = {
                let mut apps = self.lock_apps();
                let record = apps.meta.entry(id).or_default().worker_mut(worker);
                if record.immediate_restarts >= config.max_restarts {
                    record.enter(AppState::Failed);
                    false
                } else {
                    record.count_restart_attempt();
                    record.enter(AppState::WaitingForRestart);
                    true
                }
            };
            if !proceed {
                warn!(app = %config.name, worker, "worker restart budget exhausted");
                return;
            }
            tokio::time::sleep(Duration::from_millis(config.restart_delay_ms)).await;
            {
                let mut apps = self.lock_apps();
                let record = apps.meta.entry(id).or_default().worker_mut(worker);
                if record.state() != AppState::WaitingForRestart {
                    return;
                }
                record.enter(AppState::Starting);
            }
            match main.create_new_worker(Some(worker)).await {
                Ok(_) => {
                    let mut apps = self.lock_apps();
                    apps.meta
                        .entry(id)
                        .or_default()
                        .worker_mut(worker)
                        .note_running();
                    return;
                }
                Err(err) => {
                    warn!(app = %config.name, worker, error = %err, "worker respawn failed");
                }
            }
        }
    }
}
