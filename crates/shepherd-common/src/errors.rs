//! Error types for the shepherd process manager.
//!
//! All fallible operations across the workspace return [`Result`]. The
//! taxonomy separates configuration mistakes (never retried) from launch
//! failures (retried by the restart policy) and illegal-state calls
//! (rejected synchronously, no state mutation).

use thiserror::Error;

/// Result type alias for shepherd operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A requested application does not exist.
    #[error("There is no such application: {ident}")]
    NoSuchApplication { ident: String },

    /// An application with the same unique name is already registered.
    #[error("An application named '{name}' already exists")]
    DuplicateName { name: String },

    /// Invalid caller-supplied input.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Bad or incomplete application configuration.
    #[error("Configuration error for '{name}': {reason}")]
    Configuration { name: String, reason: String },

    /// The requested operation is not permitted in the current lifecycle
    /// state (start-while-running, stop-while-stopped, ...).
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// The OS process could not be spawned.
    #[error("Failed to spawn '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The IPC connection to the child's container could not be established.
    #[error("Failed to connect to the container of '{name}': {reason}")]
    ConnectFailed { name: String, reason: String },

    /// The container accepted the connection but rejected the application
    /// start request.
    #[error("Failed to start the application '{name}': {reason}")]
    StartFailed { name: String, reason: String },

    /// The peer connection to the container dropped mid-operation. Treated
    /// by the launch path as a possible synchronous-exit race, not as a
    /// start failure.
    #[error("Peer disconnected: {reason}")]
    Disconnected { reason: String },

    /// The restart budget was exhausted without a successful launch.
    #[error("Failed to start the app after {attempts} attempts\nThe last error: {last_error}")]
    RestartsExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },

    /// A concurrent stop superseded an in-flight start/restart loop.
    #[error("'{name}' was stopped while starting")]
    StoppedWhileStarting { name: String },

    /// Document store failure (load, persist, corrupt data).
    #[error("Store error: {reason}")]
    Store { reason: String },

    /// The operation is not available on this platform or transport.
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn no_such_application(ident: impl Into<String>) -> Self {
        Self::NoSuchApplication {
            ident: ident.into(),
        }
    }

    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn configuration(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub fn spawn_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn connect_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn start_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StartFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    pub fn restarts_exhausted(
        name: impl Into<String>,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RestartsExhausted {
            name: name.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    pub fn stopped_while_starting(name: impl Into<String>) -> Self {
        Self::StoppedWhileStarting { name: name.into() }
    }

    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Whether this error indicates a dropped peer connection rather than an
    /// explicit rejection.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}
