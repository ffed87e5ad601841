use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shepherd_common::Result;

/// Milestones of a live application, as epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub started: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached: Option<i64>,
}

/// One record per application believed to be running outside the current
/// supervisor lifetime. Records survive supervisor restarts and drive
/// re-attachment on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub id: u64,
    pub pid: u32,
    pub timestamps: Timestamps,
}

impl RuntimeRecord {
    pub fn new(id: u64, pid: u32, started: i64) -> Self {
        Self {
            id,
            pid,
            timestamps: Timestamps {
                started,
                attached: None,
            },
        }
    }
}

/// Collection of runtime records, keyed by application id.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    async fn all(&self) -> Result<Vec<RuntimeRecord>>;

    async fn find(&self, id: u64) -> Result<Option<RuntimeRecord>>;

    /// Insert or replace the record for `record.id`.
    async fn upsert(&self, record: RuntimeRecord) -> Result<()>;

    /// Record the moment an existing process was re-attached.
    async fn mark_attached(&self, id: u64, at: i64) -> Result<()>;

    async fn remove(&self, id: u64) -> Result<()>;
}
