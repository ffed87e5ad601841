//! Persistence for application configurations and runtime records.
//!
//! Two document collections back the supervisor: the configuration store
//! holds the desired state of every registered application, and the runtime
//! store holds one record per application that is believed to be running,
//! used to re-attach after a supervisor restart.

pub mod json;
pub mod memory;

mod config;
mod runtime;

pub use config::{AppConfig, AppMode, ConfigStore};
pub use json::{JsonConfigStore, JsonRuntimeStore};
pub use runtime::{RuntimeRecord, RuntimeStore, Timestamps};
