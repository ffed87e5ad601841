//! Manager operations: registration, start/stop/restart, cluster control
//! and reporting.

use super::types::{AppListEntry, UsageReport, WorkerStatus};
use super::{now_ms, AppProcess, LiveApp, ProcessManager};
use crate::config::{prepare_config, AppDefinition, AppRef, StopOptions};
use crate::main_process::MainProcess;
use crate::process::Process;
use shepherd_common::{AppId, Error, Result, WorkerId};
use shepherd_state::AppState;
use shepherd_store::{AppConfig, AppMode, RuntimeRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

impl ProcessManager {
    /// Resolve a reference to a registered application.
    pub(crate) async fn resolve(&self, app: AppRef) -> Result<AppConfig> {
        match app {
            AppRef::Id(id) => self
                .inner
                .configs
                .find_by_id(id)
                .await?
                .ok_or_else(|| Error::no_such_application(id.to_string())),
            AppRef::Name(name) => self
                .inner
                .configs
                .find_by_name(&name)
                .await?
                .ok_or_else(|| Error::no_such_application(name)),
            AppRef::Config(definition) => {
                let name = match (&definition.name, &definition.path) {
                    (Some(name), _) => name.clone(),
                    (None, Some(path)) => path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .map(str::to_string)
                        .ok_or_else(|| Error::invalid_argument("unnameable application"))?,
                    (None, None) => {
                        return Err(Error::invalid_argument(
                            "either a name or a path is required",
                        ))
                    }
                };
                self.inner
                    .configs
                    .find_by_name(&name)
                    .await?
                    .ok_or_else(|| Error::no_such_application(name))
            }
        }
    }

    /// Resolve a reference, registering the application first when a full
    /// definition refers to an unknown name.
    async fn resolve_or_register(&self, app: AppRef) -> Result<AppConfig> {
        if let AppRef::Config(definition) = &app {
            if let Ok(existing) = self.resolve(app.clone()).await {
                let mut merged = existing;
                definition.apply_to(&mut merged);
                self.inner.configs.update(merged.clone()).await?;
                return Ok(merged);
            }
            let config = prepare_config(definition, self.inner.ids.next(), &self.inner.options)?;
            self.inner.configs.insert(config.clone()).await?;
            info!(app = %config.name, id = config.id, "application registered");
            return Ok(config);
        }
        self.resolve(app).await
    }

    /// Register an application without starting it.
    pub async fn register(&self, definition: AppDefinition) -> Result<AppConfig> {
        self.resolve_or_register(AppRef::Config(definition)).await
    }

    /// Start an application. Resolves once the process is up (cluster: all
    /// initial workers forked). Autorestart applications retry failed
    /// launches until the restart budget is spent; otherwise the first
    /// failure surfaces directly.
    pub async fn start(&self, app: impl Into<AppRef>) -> Result<()> {
        let config = self.resolve_or_register(app.into()).await?;
        self.start_app(config, false).await
    }

    pub(crate) async fn start_app(&self, config: AppConfig, restarting: bool) -> Result<()> {
        let id = config.id;
        {
            let mut apps = self.lock_apps();
            let meta = apps.meta.entry(id).or_default();
            if !restarting && !meta.state().can_begin_start() {
                // A start landing inside an in-flight restart continues it;
                // the pending relaunch already owns the slot.
                if matches!(
                    meta.state(),
                    AppState::Restarting | AppState::WaitingForRestart
                ) {
                    return Ok(());
                }
                return Err(Error::illegal_state(format!(
                    "'{}' is already {}",
                    config.name,
                    meta.state()
                )));
            }
            meta.clear_starting_timer();
            meta.enter(AppState::Starting);
        }

        let mut last_error: Option<Error> = None;
        let mut process: Option<Arc<AppProcess>> = None;

        match self.launch(&config).await {
            Ok(p) => process = Some(p),
            Err(err) => last_error = Some(err),
        }

        if process.is_none() && config.autorestart {
            // The remaining budget shrinks with every attempt that did not
            // make it to a confirmed run since the last healthy period.
            let budget = {
                let apps = self.lock_apps();
                let immediate = apps
                    .meta
                    .get(&id)
                    .map(|m| m.immediate_restarts)
                    .unwrap_or(0);
                config.max_restarts.saturating_sub(immediate)
            };
            for _ in 0..budget {
                {
                    let mut apps = self.lock_apps();
                    let meta = apps.meta.entry(id).or_default();
                    meta.count_restart_attempt();
                    meta.enter(AppState::WaitingForRestart);
                }
                tokio::time::sleep(Duration::from_millis(config.restart_delay_ms)).await;
                {
                    let mut apps = self.lock_apps();
                    let meta = apps.meta.entry(id).or_default();
                    if meta.state() != AppState::WaitingForRestart {
                        return Err(Error::stopped_while_starting(&config.name));
                    }
                    meta.enter(AppState::Starting);
                }
                match self.launch(&config).await {
                    Ok(p) => {
                        process = Some(p);
                        break;
                    }
                    Err(err) => {
                        warn!(app = %config.name, error = %err, "launch attempt failed");
                        last_error = Some(err);
                    }
                }
            }
        }

        let process = match process {
            Some(process) => process,
            None => {
                return match last_error {
                    Some(err) => {
                        self.lock_apps()
                            .meta
                            .entry(id)
                            .or_default()
                            .enter(AppState::Failed);
                        // Without autorestart the single attempt's error
                        // surfaces as-is.
                        if config.autorestart {
                            Err(Error::restarts_exhausted(
                                &config.name,
                                config.max_restarts,
                                err.to_string(),
                            ))
                        } else {
                            Err(err)
                        }
                    }
                    None => Err(Error::stopped_while_starting(&config.name)),
                };
            }
        };

        let pid = process
            .pid()
            .ok_or_else(|| Error::illegal_state("started process has no pid"))?;
        let record = RuntimeRecord::new(id, pid, now_ms());
        self.inner.runtime.upsert(record.clone()).await?;

        {
            let mut apps = self.lock_apps();
            apps.live.insert(
                id,
                LiveApp {
                    process: process.clone(),
                    record,
                },
            );
            let meta = apps.meta.entry(id).or_default();
            match process.as_ref() {
                AppProcess::Single(_) => {
                    // Started until it survives the grace window.
                    meta.enter(AppState::Started);
                    let mgr = self.clone();
                    let grace = Duration::from_millis(config.normal_start_ms);
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let mut apps = mgr.lock_apps();
                        if let Some(meta) = apps.meta.get_mut(&id) {
                            if meta.state() == AppState::Started {
                                meta.note_running();
                            }
                        }
                    });
                    meta.set_starting_timer(timer.abort_handle());
                }
                AppProcess::Cluster(mp) => {
                    meta.note_running();
                    for wid in mp.live_worker_ids() {
                        meta.worker_mut(wid).note_running();
                    }
                }
            }
        }

        self.watch_process_exit(id, process.clone());
        if let Some(mp) = process.as_cluster() {
            self.pump_cluster_events(id, mp);
        }
        info!(app = %config.name, pid, restarting, "application started");
        Ok(())
    }

    async fn launch(&self, config: &AppConfig) -> Result<Arc<AppProcess>> {
        match config.mode {
            AppMode::Single => {
                let process = Process::new(config.clone(), self.inner.transport.clone());
                process.start().await?;
                Ok(Arc::new(AppProcess::Single(process)))
            }
            AppMode::Cluster => {
                let main = MainProcess::new(config.clone(), self.inner.transport.clone());
                main.start().await?;
                Ok(Arc::new(AppProcess::Cluster(main)))
            }
        }
    }

    /// Stop an application. Also aborts a start loop parked between restart
    /// attempts.
    pub async fn stop(&self, app: impl Into<AppRef>, options: StopOptions) -> Result<()> {
        let config = self.resolve(app.into()).await?;
        let id = config.id;
        let process = {
            let mut apps = self.lock_apps();
            let meta = apps.meta.entry(id).or_default();
            if meta.state().is_stopped_like() {
                return Err(Error::illegal_state("Has been already stopped"));
            }
            meta.clear_starting_timer();
            meta.enter(AppState::Stopping);
            for wid in meta.worker_ids() {
                meta.worker_mut(wid).enter(AppState::Stopping);
            }
            apps.live.get(&id).map(|live| live.process.clone())
        };
        match process {
            Some(process) => process.exit(options).await?,
            None => {
                // No live process: the app was parked between restart
                // attempts; the state change above aborts that loop.
                self.lock_apps()
                    .meta
                    .entry(id)
                    .or_default()
                    .enter(AppState::Stopped);
            }
        }
        info!(app = %config.name, "application stopped");
        Ok(())
    }

    /// Stop (when running) and start again with a fresh restart budget.
    pub async fn restart(&self, app: impl Into<AppRef>) -> Result<()> {
        let config = self.resolve(app.into()).await?;
        let id = config.id;
        let running = {
            let apps = self.lock_apps();
            apps.meta
                .get(&id)
                .map(|m| !m.state().is_stopped_like() && m.state() != AppState::Failed)
                .unwrap_or(false)
        };
        if running {
            self.stop(AppRef::Id(id), StopOptions::default()).await?;
        }
        self.lock_apps().meta.entry(id).or_default().immediate_restarts = 0;
        self.start_app(config, false).await
    }

    /// Unregister an application, stopping it first when needed. Its
    /// lifecycle record and runtime record are discarded.
    pub async fn delete(&self, app: impl Into<AppRef>) -> Result<()> {
        let config = self.resolve(app.into()).await?;
        let id = config.id;
        let running = {
            let apps = self.lock_apps();
            apps.meta
                .get(&id)
                .map(|m| !m.state().is_stopped_like() && m.state() != AppState::Failed)
                .unwrap_or(false)
        };
        if running {
            self.stop(AppRef::Id(id), StopOptions::default()).await?;
        }
        self.inner.configs.remove(id).await?;
        self.inner.runtime.remove(id).await?;
        {
            let mut apps = self.lock_apps();
            apps.meta.remove(&id);
            apps.live.remove(&id);
        }
        info!(app = %config.name, id, "application deleted");
        Ok(())
    }

    /// Overlay a definition onto the stored config. Takes effect on the next
    /// start.
    pub async fn update_config(
        &self,
        app: impl Into<AppRef>,
        definition: &AppDefinition,
    ) -> Result<AppConfig> {
        let mut config = self.resolve(app.into()).await?;
        definition.apply_to(&mut config);
        if config.mode == AppMode::Cluster && config.interpreter != "node" {
            return Err(Error::configuration(
                &config.name,
                "cluster mode is only supported for node applications",
            ));
        }
        self.inner.configs.update(config.clone()).await?;
        Ok(config)
    }

    fn live_cluster(&self, id: AppId, name: &str) -> Result<Arc<AppProcess>> {
        let apps = self.lock_apps();
        let live = apps
            .live
            .get(&id)
            .ok_or_else(|| Error::illegal_state(format!("'{name}' is not running")))?;
        if live.process.as_cluster().is_none() {
            return Err(Error::illegal_state(format!(
                "'{name}' is not a cluster application"
            )));
        }
        Ok(live.process.clone())
    }

    /// Bring a running cluster to exactly `instances` workers and persist
    /// the new instance count.
    pub async fn scale(&self, app: impl Into<AppRef>, instances: u32) -> Result<()> {
        let config = self.resolve(app.into()).await?;
        let id = config.id;
        let process = self.live_cluster(id, &config.name)?;
        {
            let mut apps = self.lock_apps();
            let meta = apps.meta.entry(id).or_default();
            if !meta.state().is_started() {
                return Err(Error::illegal_state(format!(
                    "'{}' is not running",
                    config.name
                )));
            }
            meta.enter(AppState::Scaling);
        }

        let main = match process.as_cluster() {
            Some(main) => main,
            None => return Err(Error::illegal_state("not a cluster application")),
        };
        let result = main.scale(instances).await;

        {
            let mut apps = self.lock_apps();
            let meta = apps.meta.entry(id).or_default();
            let live_ids = main.live_worker_ids();
            for wid in meta.worker_ids() {
                if !live_ids.contains(&wid) {
                    meta.remove_worker(wid);
                }
            }
            for wid in live_ids {
                meta.worker_mut(wid).note_running();
            }
            meta.note_running();
        }
        result?;

        self.inner.configs.set_instances(id, instances).await?;
        Ok(())
    }

    /// Rolling restart of every worker of a running cluster, one at a time.
    pub async fn reload(&self, app: impl Into<AppRef>) -> Result<()> {
        let config = self.resolve(app.into()).await?;
        let id = config.id;
        let process = self.live_cluster(id, &config.name)?;
        let main = match process.as_cluster() {
            Some(main) => main,
            None => return Err(Error::illegal_state("not a cluster application")),
        };
        self.lock_apps()
            .meta
            .entry(id)
            .or_default()
            .enter(AppState::Reloading);

        for wid in main.live_worker_ids() {
            {
                let mut apps = self.lock_apps();
                apps.meta
                    .entry(id)
                    .or_default()
                    .worker_mut(wid)
                    .enter(AppState::Restarting);
            }
            let result = main.restart_worker(wid).await;
            let mut apps = self.lock_apps();
            let meta = apps.meta.entry(id).or_default();
            match result {
                Ok(()) => meta.worker_mut(wid).note_running(),
                Err(err) => {
                    meta.worker_mut(wid).enter(AppState::Failed);
                    meta.note_running();
                    return Err(err);
                }
            }
        }

        self.lock_apps().meta.entry(id).or_default().note_running();
        info!(app = %config.name, "reload complete");
        Ok(())
    }

    /// Force-kill one worker. The per-worker restart policy applies as for
    /// any other worker death.
    pub async fn kill_worker(&self, app: impl Into<AppRef>, worker: WorkerId) -> Result<()> {
        let config = self.resolve(app.into()).await?;
        let process = self.live_cluster(config.id, &config.name)?;
        match process.as_cluster() {
            Some(main) => main.kill_worker(worker).await,
            None => Err(Error::illegal_state("not a cluster application")),
        }
    }

    /// Restart one worker. For autorestart applications the worker's
    /// immediate budget is refilled and the kill is left to the exit
    /// handler; otherwise the worker is replaced in place.
    pub async fn restart_worker(&self, app: impl Into<AppRef>, worker: WorkerId) -> Result<()> {
        let config = self.resolve(app.into()).await?;
        let id = config.id;
        let process = self.live_cluster(id, &config.name)?;
        let main = match process.as_cluster() {
            Some(main) => main,
            None => return Err(Error::illegal_state("not a cluster application")),
        };
        if config.autorestart {
            {
                let mut apps = self.lock_apps();
                apps.meta
                    .entry(id)
                    .or_default()
                    .worker_mut(worker)
                    .immediate_restarts = 0;
            }
            main.kill_worker(worker).await
        } else {
            {
                let mut apps = self.lock_apps();
                apps.meta
                    .entry(id)
                    .or_default()
                    .worker_mut(worker)
                    .enter(AppState::Restarting);
            }
            main.restart_worker(worker).await?;
            self.lock_apps()
                .meta
                .entry(id)
                .or_default()
                .worker_mut(worker)
                .note_running();
            Ok(())
        }
    }

    pub async fn has_application(&self, app: impl Into<AppRef>) -> Result<bool> {
        match self.resolve(app.into()).await {
            Ok(_) => Ok(true),
            Err(Error::NoSuchApplication { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn started(&self, app: impl Into<AppRef>) -> Result<bool> {
        let config = self.resolve(app.into()).await?;
        let apps = self.lock_apps();
        Ok(apps
            .meta
            .get(&config.id)
            .map(|m| m.state().is_started())
            .unwrap_or(false))
    }

    pub fn app_state(&self, id: AppId) -> AppState {
        self.lock_apps()
            .meta
            .get(&id)
            .map(|m| m.state())
            .unwrap_or(AppState::Stopped)
    }

    pub fn restarts(&self, id: AppId) -> u32 {
        self.lock_apps().meta.get(&id).map(|m| m.restarts).unwrap_or(0)
    }

    /// Snapshot of every registered application.
    pub async fn list(&self) -> Result<Vec<AppListEntry>> {
        let configs = self.inner.configs.all().await?;
        let mut entries = Vec::with_capacity(configs.len());
        for config in configs {
            let record = self.inner.runtime.find(config.id).await?;
            let (state, pid, restarts, workers) = {
                let apps = self.lock_apps();
                let meta = apps.meta.get(&config.id);
                let live = apps.live.get(&config.id);
                let workers = live
                    .and_then(|l| l.process.as_cluster())
                    .map(|main| {
                        main.workers()
                            .into_iter()
                            .map(|(wid, entry)| WorkerStatus {
                                id: wid,
                                pid: entry.pid,
                                alive: entry.alive,
                                state: meta.and_then(|m| m.worker(wid)).map(|w| w.state()),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (
                    meta.map(|m| m.state()).unwrap_or(AppState::Stopped),
                    live.and_then(|l| l.process.pid()),
                    meta.map(|m| m.restarts).unwrap_or(0),
                    workers,
                )
            };
            let usage = match pid {
                Some(pid) => self.inner.usage.lookup(pid).await,
                None => Default::default(),
            };
            entries.push(AppListEntry {
                id: config.id,
                name: config.name.clone(),
                mode: config.mode,
                state,
                pid,
                restarts,
                started_at: record.as_ref().map(|r| r.timestamps.started),
                uptime_ms: record
                    .filter(|_| state.is_started())
                    .map(|r| (now_ms() - r.timestamps.started).max(0) as u64),
                usage,
                workers,
            });
        }
        Ok(entries)
    }

    /// Per-worker status of a running cluster application.
    pub async fn workers(&self, app: impl Into<AppRef>) -> Result<Vec<WorkerStatus>> {
        let config = self.resolve(app.into()).await?;
        let process = self.live_cluster(config.id, &config.name)?;
        let apps = self.lock_apps();
        let meta = apps.meta.get(&config.id);
        Ok(process
            .as_cluster()
            .map(|main| {
                main.workers()
                    .into_iter()
                    .map(|(wid, entry)| WorkerStatus {
                        id: wid,
                        pid: entry.pid,
                        alive: entry.alive,
                        state: meta.and_then(|m| m.worker(wid)).map(|w| w.state()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// CPU and memory usage of an application and its workers.
    pub async fn usage(&self, app: impl Into<AppRef>) -> Result<UsageReport> {
        let config = self.resolve(app.into()).await?;
        let (pid, worker_pids) = {
            let apps = self.lock_apps();
            let live = apps.live.get(&config.id).ok_or_else(|| {
                Error::illegal_state(format!("'{}' is not running", config.name))
            })?;
            let worker_pids: Vec<(WorkerId, u32)> = live
                .process
                .as_cluster()
                .map(|main| {
                    main.workers()
                        .into_iter()
                        .filter(|(_, w)| w.alive)
                        .map(|(wid, w)| (wid, w.pid))
                        .collect()
                })
                .unwrap_or_default();
            (live.process.pid(), worker_pids)
        };
        let main = match pid {
            Some(pid) => self.inner.usage.lookup(pid).await,
            None => Default::default(),
        };
        let mut workers = Vec::with_capacity(worker_pids.len());
        for (wid, wpid) in worker_pids {
            workers.push((wid, self.inner.usage.lookup(wpid).await));
        }
        Ok(UsageReport { main, workers })
    }

    /// Milliseconds since the current incarnation started, `None` when the
    /// application is not running.
    pub async fn uptime(&self, app: impl Into<AppRef>) -> Result<Option<u64>> {
        let config = self.resolve(app.into()).await?;
        Ok(self
            .inner
            .runtime
            .find(config.id)
            .await?
            .map(|record| (now_ms() - record.timestamps.started).max(0) as u64))
    }

    pub async fn stdout_path(&self, app: impl Into<AppRef>) -> Result<PathBuf> {
        Ok(self.resolve(app.into()).await?.stdout)
    }

    pub async fn tail_stdout(&self, app: impl Into<AppRef>, lines: usize) -> Result<String> {
        let config = self.resolve(app.into()).await?;
        tail_file(&config.stdout, lines).await
    }

    pub async fn tail_stderr(&self, app: impl Into<AppRef>, lines: usize) -> Result<String> {
        let config = self.resolve(app.into()).await?;
        tail_file(&config.stderr, lines).await
    }
}

async fn tail_file(path: &Path, lines: usize) -> Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut tail: Vec<&str> = content.lines().rev().take(lines).collect();
    tail.reverse();
    Ok(tail.join("\n"))
}
