//! Scripted transport, container and probe for exercising the manager
//! without real OS processes.
#![allow(dead_code)]

use async_trait::async_trait;
use shepherd_common::{Error, ExitStatus, Result, Signal, WorkerId};
use shepherd_metrics::{ProcessTimes, SystemProbe};
use shepherd_process::ProcessHandle;
use shepherd_store::memory::{MemoryConfigStore, MemoryRuntimeStore};
use shepherd_store::AppConfig;
use shepherd_supervise::{
    AppDefinition, Container, ProcessManager, ProcessTransport, SupervisorOptions, WorkerExit,
    WorkerInfo,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

pub struct MockHandle {
    pid: u32,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    kills: Mutex<Vec<Signal>>,
}

impl MockHandle {
    pub fn new(pid: u32) -> Arc<Self> {
        let (exit_tx, exit_rx) = watch::channel(None);
        Arc::new(Self {
            pid,
            exit_tx,
            exit_rx,
            kills: Mutex::new(Vec::new()),
        })
    }

    /// Simulate the process exiting on its own.
    pub fn force_exit(&self, status: ExitStatus) {
        let _ = self.exit_tx.send(Some(status));
    }

    pub fn kills(&self) -> Vec<Signal> {
        self.kills.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessHandle for MockHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    fn kill(&self, signal: Signal) -> Result<()> {
        self.kills.lock().unwrap().push(signal);
        self.force_exit(ExitStatus::with_signal(signal.as_str()));
        Ok(())
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

#[derive(Clone, Copy)]
struct MockWorker {
    pid: u32,
    alive: bool,
}

pub struct MockContainer {
    /// Whether a graceful shutdown request makes the process exit cleanly.
    pub cooperative: AtomicBool,
    /// Whether the next start call exits the process mid-handshake.
    pub start_disconnects: AtomicBool,
    ping_ok: AtomicBool,
    handle: Mutex<Option<Arc<MockHandle>>>,
    workers: Mutex<HashMap<WorkerId, MockWorker>>,
    next_worker_pid: AtomicU32,
    exit_subs: Mutex<Vec<mpsc::UnboundedSender<WorkerExit>>>,
    closed_tx: watch::Sender<bool>,
}

impl MockContainer {
    fn new(ping_ok: bool) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            cooperative: AtomicBool::new(true),
            start_disconnects: AtomicBool::new(false),
            ping_ok: AtomicBool::new(ping_ok),
            handle: Mutex::new(None),
            workers: Mutex::new(HashMap::new()),
            next_worker_pid: AtomicU32::new(1000),
            exit_subs: Mutex::new(Vec::new()),
            closed_tx,
        })
    }

    fn bind(&self, handle: Arc<MockHandle>) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Pretend a worker crashed: mark it dead and notify subscribers.
    pub fn emit_worker_exit(&self, id: WorkerId, status: ExitStatus) {
        let pid = {
            let mut workers = self.workers.lock().unwrap();
            let Some(worker) = workers.get_mut(&id) else {
                return;
            };
            worker.alive = false;
            worker.pid
        };
        let subs = self.exit_subs.lock().unwrap();
        for sub in subs.iter() {
            let _ = sub.send(WorkerExit {
                id,
                pid,
                status: status.clone(),
            });
        }
    }

    /// Simulate the control channel dropping.
    pub fn drop_connection(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn worker_pid(&self, id: WorkerId) -> Option<u32> {
        self.workers.lock().unwrap().get(&id).map(|w| w.pid)
    }

    /// Pre-seed the worker table, for attach scenarios.
    pub fn seed_worker(&self, id: WorkerId, pid: u32, alive: bool) {
        self.workers
            .lock()
            .unwrap()
            .insert(id, MockWorker { pid, alive });
    }
}

#[async_trait]
impl Container for MockContainer {
    async fn start(&self) -> Result<()> {
        if self.start_disconnects.swap(false, Ordering::SeqCst) {
            if let Some(handle) = self.handle.lock().unwrap().clone() {
                handle.force_exit(ExitStatus::with_code(1));
            }
            return Err(Error::disconnected("scripted handshake drop"));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::disconnected("scripted ping failure"))
        }
    }

    async fn initiate_graceful_shutdown(&self) -> Result<()> {
        if self.cooperative.load(Ordering::SeqCst) {
            if let Some(handle) = self.handle.lock().unwrap().clone() {
                handle.force_exit(ExitStatus::with_code(0));
            }
        }
        Ok(())
    }

    async fn spawn_worker(&self, id: WorkerId) -> Result<WorkerInfo> {
        let pid = self.next_worker_pid.fetch_add(1, Ordering::SeqCst);
        self.workers
            .lock()
            .unwrap()
            .insert(id, MockWorker { pid, alive: true });
        Ok(WorkerInfo {
            id,
            pid,
            alive: true,
        })
    }

    async fn drop_worker(&self, id: WorkerId) -> Result<()> {
        self.workers.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn kill_worker(&self, id: WorkerId) -> Result<()> {
        self.emit_worker_exit(id, ExitStatus::with_signal("SIGKILL"));
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        Ok(self
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, w)| WorkerInfo {
                id: *id,
                pid: w.pid,
                alive: w.alive,
            })
            .collect())
    }

    fn subscribe_worker_exits(&self) -> mpsc::UnboundedReceiver<WorkerExit> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.exit_subs.lock().unwrap().push(tx);
        rx
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

/// Outcome of the next `spawn` call.
pub enum SpawnPlan {
    Ok,
    Fail,
    /// Spawn succeeds but the process dies right away with this status.
    ExitImmediately(ExitStatus),
}

pub struct MockTransport {
    next_pid: AtomicU32,
    plans: Mutex<VecDeque<SpawnPlan>>,
    pub handles: Mutex<Vec<Arc<MockHandle>>>,
    pub attached: Mutex<Vec<Arc<MockHandle>>>,
    containers: Mutex<HashMap<u32, Arc<MockContainer>>>,
    ping_fail_pids: Mutex<HashSet<u32>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(100),
            plans: Mutex::new(VecDeque::new()),
            handles: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            ping_fail_pids: Mutex::new(HashSet::new()),
        })
    }

    pub fn plan(&self, plans: Vec<SpawnPlan>) {
        self.plans.lock().unwrap().extend(plans);
    }

    pub fn fail_ping_for(&self, pid: u32) {
        self.ping_fail_pids.lock().unwrap().insert(pid);
    }

    pub fn last_handle(&self) -> Arc<MockHandle> {
        self.handles.lock().unwrap().last().cloned().expect("no process spawned")
    }

    pub fn container_for(&self, pid: u32) -> Arc<MockContainer> {
        self.containers
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .expect("no container for pid")
    }

    pub fn spawned_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Pre-create the container a later `connect` for this pid will find.
    pub fn seed_container(&self, pid: u32) -> Arc<MockContainer> {
        self.container_entry(pid)
    }

    fn container_entry(&self, pid: u32) -> Arc<MockContainer> {
        let ping_ok = !self.ping_fail_pids.lock().unwrap().contains(&pid);
        self.containers
            .lock()
            .unwrap()
            .entry(pid)
            .or_insert_with(|| MockContainer::new(ping_ok))
            .clone()
    }
}

#[async_trait]
impl ProcessTransport for MockTransport {
    async fn spawn(&self, config: &AppConfig) -> Result<Arc<dyn ProcessHandle>> {
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SpawnPlan::Ok);
        match plan {
            SpawnPlan::Fail => Err(Error::spawn_failed(&config.name, "scripted spawn failure")),
            SpawnPlan::Ok | SpawnPlan::ExitImmediately(_) => {
                let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
                let handle = MockHandle::new(pid);
                let container = self.container_entry(pid);
                container.bind(handle.clone());
                self.handles.lock().unwrap().push(handle.clone());
                if let SpawnPlan::ExitImmediately(status) = plan {
                    handle.force_exit(status);
                }
                Ok(handle)
            }
        }
    }

    async fn connect(&self, _config: &AppConfig, pid: u32) -> Result<Arc<dyn Container>> {
        Ok(self.container_entry(pid))
    }

    fn attach(&self, pid: u32, _closed: Option<watch::Receiver<bool>>) -> Arc<dyn ProcessHandle> {
        let handle = MockHandle::new(pid);
        self.attached.lock().unwrap().push(handle.clone());
        handle
    }
}

#[derive(Default)]
pub struct MockProbe {
    times: Mutex<HashMap<u32, ProcessTimes>>,
}

impl MockProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, pid: u32, times: ProcessTimes) {
        self.times.lock().unwrap().insert(pid, times);
    }

    pub fn remove(&self, pid: u32) {
        self.times.lock().unwrap().remove(&pid);
    }
}

#[async_trait]
impl SystemProbe for MockProbe {
    async fn times(&self, pid: u32) -> Option<ProcessTimes> {
        self.times.lock().unwrap().get(&pid).copied()
    }
}

pub fn times_started_at(start_time_ms: i64) -> ProcessTimes {
    ProcessTimes {
        rss_bytes: 1024 * 1024,
        cpu_ms: 10,
        uptime_ms: 1000,
        start_time_ms,
    }
}

pub struct Harness {
    pub manager: ProcessManager,
    pub transport: Arc<MockTransport>,
    pub probe: Arc<MockProbe>,
    pub configs: Arc<MemoryConfigStore>,
    pub runtime: Arc<MemoryRuntimeStore>,
}

pub async fn harness() -> Harness {
    let transport = MockTransport::new();
    let probe = MockProbe::new();
    let configs = Arc::new(MemoryConfigStore::new());
    let runtime = Arc::new(MemoryRuntimeStore::new());
    let manager = ProcessManager::new(
        SupervisorOptions::new("/tmp/shepherd-tests"),
        configs.clone(),
        runtime.clone(),
        transport.clone(),
        probe.clone(),
    )
    .await
    .expect("manager construction");
    Harness {
        manager,
        transport,
        probe,
        configs,
        runtime,
    }
}

/// A single-mode node app with test-friendly short timings.
pub fn definition(name: &str) -> AppDefinition {
    AppDefinition {
        name: Some(name.to_string()),
        normal_start_ms: Some(40),
        restart_delay_ms: Some(5),
        kill_timeout_ms: Some(100),
        instances: Some(1),
        ..AppDefinition::for_path(format!("/srv/{name}.js"))
    }
}

/// Wait until `check` passes or the timeout elapses.
pub async fn wait_for(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not met within the timeout");
}
