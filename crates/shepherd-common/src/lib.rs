//! Shared types and errors for the shepherd process manager.

pub mod errors;
pub mod types;

pub use errors::{Error, Result};
pub use types::{AppId, ExitStatus, IdGenerator, Signal, WorkerId};
