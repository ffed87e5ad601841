//! Resource usage sampling for supervised processes.
//!
//! The [`SystemProbe`] trait abstracts the OS interrogation so the usage
//! arithmetic can be tested without live processes; [`SysinfoProbe`] is the
//! real implementation.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::trace;

/// Raw per-process counters sampled from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTimes {
    /// Resident set size, bytes.
    pub rss_bytes: u64,
    /// Total CPU time consumed (kernel + user), milliseconds.
    pub cpu_ms: u64,
    /// Wall-clock time since the process started, milliseconds.
    pub uptime_ms: u64,
    /// Process start moment, epoch milliseconds.
    pub start_time_ms: i64,
}

/// Source of per-process counters. Returns `None` when the pid is gone.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn times(&self, pid: u32) -> Option<ProcessTimes>;
}

/// [`SystemProbe`] backed by the `sysinfo` crate.
#[derive(Default)]
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn times(&self, pid: u32) -> Option<ProcessTimes> {
        let mut system = self.system.lock().ok()?;
        let target = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        let process = system.process(target)?;
        Some(ProcessTimes {
            rss_bytes: process.memory(),
            cpu_ms: process.accumulated_cpu_time(),
            uptime_ms: process.run_time() * 1000,
            start_time_ms: process.start_time() as i64 * 1000,
        })
    }
}

/// A single usage report. `None` fields mean the pid could not be sampled.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    /// Average CPU load over the window since the previous sample, percent.
    pub cpu: Option<f64>,
    /// Resident set size, bytes.
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct CpuSnapshot {
    cpu_ms: u64,
    uptime_ms: u64,
}

/// Computes CPU and memory usage per pid.
///
/// CPU load is derived from the delta between consecutive samples, so the
/// first lookup for a pid reports the average over the whole process
/// lifetime and later lookups report the average since the previous call.
pub struct UsageProvider {
    probe: std::sync::Arc<dyn SystemProbe>,
    history: Mutex<HashMap<u32, CpuSnapshot>>,
}

impl UsageProvider {
    pub fn new(probe: std::sync::Arc<dyn SystemProbe>) -> Self {
        Self {
            probe,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, pid: u32) -> Usage {
        let Some(times) = self.probe.times(pid).await else {
            trace!(pid, "usage lookup for a dead pid");
            return Usage::default();
        };

        let cpu = {
            let mut history = match self.history.lock() {
                Ok(guard) => guard,
                Err(_) => return Usage::default(),
            };
            let previous = history.insert(
                pid,
                CpuSnapshot {
                    cpu_ms: times.cpu_ms,
                    uptime_ms: times.uptime_ms,
                },
            );
            let (cpu_base, uptime_base) = match previous {
                Some(snapshot) if snapshot.uptime_ms <= times.uptime_ms => {
                    (snapshot.cpu_ms, snapshot.uptime_ms)
                }
                // Uptime went backwards, the pid was reused. Start over.
                _ => (0, 0),
            };
            let window = times.uptime_ms.saturating_sub(uptime_base);
            if window == 0 {
                None
            } else {
                let busy = times.cpu_ms.saturating_sub(cpu_base);
                Some(busy as f64 / window as f64 * 100.0)
            }
        };

        Usage {
            cpu,
            memory: Some(times.rss_bytes),
        }
    }

    /// Drop the sampling history of one pid, after its process exits.
    pub fn clear(&self, pid: u32) {
        if let Ok(mut history) = self.history.lock() {
            history.remove(&pid);
        }
    }

    pub fn clear_all(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeProbe {
        samples: Mutex<Vec<Option<ProcessTimes>>>,
    }

    impl FakeProbe {
        fn new(samples: Vec<Option<ProcessTimes>>) -> Self {
            Self {
                samples: Mutex::new(samples),
            }
        }
    }

    #[async_trait]
    impl SystemProbe for FakeProbe {
        async fn times(&self, _pid: u32) -> Option<ProcessTimes> {
            let mut samples = self.samples.lock().unwrap();
            if samples.is_empty() {
                None
            } else {
                samples.remove(0)
            }
        }
    }

    fn times(cpu_ms: u64, uptime_ms: u64) -> ProcessTimes {
        ProcessTimes {
            rss_bytes: 64 * 1024 * 1024,
            cpu_ms,
            uptime_ms,
            start_time_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn cpu_load_is_delta_over_window() {
        let probe = Arc::new(FakeProbe::new(vec![
            Some(times(500, 1_000)),
            Some(times(750, 2_000)),
        ]));
        let provider = UsageProvider::new(probe);

        // First sample averages over the whole lifetime: 500ms of 1000ms.
        let first = provider.lookup(42).await;
        assert_eq!(first.cpu, Some(50.0));

        // Second sample covers only the window: 250ms of 1000ms.
        let second = provider.lookup(42).await;
        assert_eq!(second.cpu, Some(25.0));
        assert_eq!(second.memory, Some(64 * 1024 * 1024));
    }

    #[tokio::test]
    async fn dead_pid_reports_empty_usage() {
        let provider = UsageProvider::new(Arc::new(FakeProbe::new(vec![None])));
        let usage = provider.lookup(42).await;
        assert!(usage.cpu.is_none());
        assert!(usage.memory.is_none());
    }

    #[tokio::test]
    async fn clear_resets_the_window() {
        let probe = Arc::new(FakeProbe::new(vec![
            Some(times(500, 1_000)),
            Some(times(600, 2_000)),
        ]));
        let provider = UsageProvider::new(probe);

        provider.lookup(42).await;
        provider.clear(42);

        // With no history the second sample again averages over the lifetime.
        let usage = provider.lookup(42).await;
        assert_eq!(usage.cpu, Some(30.0));
    }
}
