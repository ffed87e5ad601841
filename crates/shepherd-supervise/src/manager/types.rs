use serde::Serialize;
use shepherd_common::{AppId, WorkerId};
use shepherd_metrics::Usage;
use shepherd_state::AppState;
use shepherd_store::AppMode;

/// Lifecycle of the manager itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl ManagerState {
    /// While shutting down, process exits are recorded but never trigger a
    /// restart and never invalidate runtime records of live processes.
    pub fn is_stopping(&self) -> bool {
        matches!(self, ManagerState::Stopping | ManagerState::Stopped)
    }
}

/// One row of `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct AppListEntry {
    pub id: AppId,
    pub name: String,
    pub mode: AppMode,
    pub state: AppState,
    pub pid: Option<u32>,
    pub restarts: u32,
    /// Epoch ms when the current incarnation started, if running.
    pub started_at: Option<i64>,
    pub uptime_ms: Option<u64>,
    pub usage: Usage,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub pid: u32,
    pub alive: bool,
    pub state: Option<AppState>,
}

/// Resource usage of an application, main process plus workers.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub main: Usage,
    pub workers: Vec<(WorkerId, Usage)>,
}
