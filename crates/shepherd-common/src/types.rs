//! Core identifier and process-outcome types shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a managed application, assigned once at registration and
/// immutable afterwards.
pub type AppId = u64;

/// Identifier of a worker inside a cluster-mode application.
pub type WorkerId = u32;

/// Monotonic application-id generator.
///
/// Seeded from the highest id found in the configuration store at manager
/// startup so restarts never reuse an id.
#[derive(Debug)]
pub struct IdGenerator {
    current: AtomicU64,
}

impl IdGenerator {
    pub fn starting_at(start: AppId) -> Self {
        Self {
            current: AtomicU64::new(start),
        }
    }

    pub fn next(&self) -> AppId {
        self.current.fetch_add(1, Ordering::Relaxed)
    }
}

/// OS signal subset used for process control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Term,
    Kill,
    Usr1,
    Usr2,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a terminated OS process.
///
/// Exactly one of `code` / `signal` is normally set. An exit synthesized by
/// the remote-process monitor (the real outcome is unobservable for a process
/// we only attached to) carries code `-1` and the `"UNKNOWN"` signal marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn with_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    /// The placeholder status synthesized for a remotely monitored process
    /// that disappeared: code `-1` plus the `"UNKNOWN"` signal marker.
    pub fn unknown() -> Self {
        Self {
            code: Some(-1),
            signal: Some("UNKNOWN".to_string()),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "terminated by signal {signal}"),
            (None, None) => f.write_str("exited"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_is_monotonic() {
        let ids = IdGenerator::starting_at(7);
        assert_eq!(ids.next(), 7);
        assert_eq!(ids.next(), 8);
        assert_eq!(ids.next(), 9);
    }

    #[test]
    fn exit_status_display() {
        assert_eq!(ExitStatus::with_code(1).to_string(), "exited with code 1");
        assert_eq!(
            ExitStatus::with_signal("SIGKILL").to_string(),
            "terminated by signal SIGKILL"
        );
        assert!(ExitStatus::with_code(0).success());
        assert!(!ExitStatus::unknown().success());
    }
}
