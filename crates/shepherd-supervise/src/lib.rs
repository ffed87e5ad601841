//! Application supervision: lifecycle orchestration, bounded restarts,
//! cluster worker management and resurrection across supervisor restarts.
//!
//! The entry point is [`ProcessManager`]; the [`ProcessTransport`] and
//! [`Container`] traits are the seams towards the actual OS processes.

pub mod config;
pub mod container;
pub mod main_process;
pub mod manager;
pub mod process;

pub use config::{prepare_config, AppDefinition, AppRef, StopOptions, SupervisorOptions};
pub use container::{Container, OsTransport, ProcessTransport, WorkerExit, WorkerInfo};
pub use main_process::{MainProcess, WorkerEntry};
pub use manager::{AppListEntry, AppProcess, ManagerState, ProcessManager, UsageReport, WorkerStatus};
pub use process::Process;
