//! Lifecycle state machine for supervised applications and cluster workers.
//!
//! The same state set applies at the application level and, for cluster
//! applications, at the per-worker level. Records are created lazily with a
//! safe `Stopped` baseline and live for the manager's lifetime; only an
//! explicit application delete discards them.

use serde::{Deserialize, Serialize};
use shepherd_common::WorkerId;
use std::collections::HashMap;
use std::fmt;
use tokio::task::AbortHandle;
use tracing::trace;

/// Lifecycle state of an application or worker.
///
/// `Started` means the process launched but is still inside the
/// `normal_start` grace window; surviving the window promotes it to
/// `Running`, which is the only transition that resets the
/// immediate-restart counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    Stopped,
    Starting,
    Started,
    Running,
    Stopping,
    Failed,
    WaitingForRestart,
    Restarting,
    Attaching,
    Reloading,
    Scaling,
}

impl AppState {
    /// Humanized lowercase name, as reported by `list()`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Stopped => "stopped",
            AppState::Starting => "starting",
            AppState::Started => "started",
            AppState::Running => "running",
            AppState::Stopping => "stopping",
            AppState::Failed => "failed",
            AppState::WaitingForRestart => "waiting_for_restart",
            AppState::Restarting => "restarting",
            AppState::Attaching => "attaching",
            AppState::Reloading => "reloading",
            AppState::Scaling => "scaling",
        }
    }

    /// A `started` application has launched and not confirmed an exit yet.
    pub fn is_started(&self) -> bool {
        matches!(self, AppState::Started | AppState::Running)
    }

    /// States from which a fresh manual `start()` is permitted.
    pub fn can_begin_start(&self) -> bool {
        matches!(self, AppState::Stopped | AppState::Failed)
    }

    pub fn is_stopped_like(&self) -> bool {
        matches!(self, AppState::Stopped | AppState::Stopping)
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable lifecycle record for one cluster worker.
#[derive(Debug, Default)]
pub struct WorkerMeta {
    state_cell: StateCell,
    /// Lifetime restart counter.
    pub restarts: u32,
    /// Consecutive restart attempts since the worker last reached `Running`.
    pub immediate_restarts: u32,
}

/// Mutable lifecycle record for one application.
#[derive(Debug, Default)]
pub struct AppMeta {
    state_cell: StateCell,
    pub restarts: u32,
    pub immediate_restarts: u32,
    workers: HashMap<WorkerId, WorkerMeta>,
}

/// State plus the pending grace-window timer, shared by both meta levels.
#[derive(Debug)]
struct StateCell {
    state: AppState,
    starting_timer: Option<AbortHandle>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: AppState::Stopped,
            starting_timer: None,
        }
    }
}

impl StateCell {
    fn enter(&mut self, next: AppState) {
        trace!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.starting_timer.take() {
            timer.abort();
        }
    }
}

macro_rules! state_cell_accessors {
    () => {
        pub fn state(&self) -> AppState {
            self.state_cell.state
        }

        pub fn enter(&mut self, next: AppState) {
            self.state_cell.enter(next);
        }

        /// Transition into `Running`; the only path that resets the
        /// immediate-restart budget.
        pub fn note_running(&mut self) {
            self.state_cell.enter(AppState::Running);
            self.immediate_restarts = 0;
        }

        /// Install the grace-window timer task handle, aborting any pending
        /// one first.
        pub fn set_starting_timer(&mut self, handle: AbortHandle) {
            self.state_cell.clear_timer();
            self.state_cell.starting_timer = Some(handle);
        }

        /// Abort and drop the pending grace-window timer, if any.
        pub fn clear_starting_timer(&mut self) {
            self.state_cell.clear_timer();
        }

        /// Record one restart attempt against both counters.
        pub fn count_restart_attempt(&mut self) {
            self.restarts += 1;
            self.immediate_restarts += 1;
        }
    };
}

impl WorkerMeta {
    state_cell_accessors!();
}

impl AppMeta {
    state_cell_accessors!();

    /// Get-or-create accessor for a worker record; unseen ids start from a
    /// safe `Stopped` baseline.
    pub fn worker_mut(&mut self, id: WorkerId) -> &mut WorkerMeta {
        self.workers.entry(id).or_default()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerMeta> {
        self.workers.get(&id)
    }

    pub fn remove_worker(&mut self, id: WorkerId) {
        if let Some(mut meta) = self.workers.remove(&id) {
            meta.clear_starting_timer();
        }
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
