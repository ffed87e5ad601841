use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shepherd_common::Result;
use std::collections::HashMap;
use std::path::PathBuf;

/// Execution mode of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppMode {
    /// One process running the script.
    Single,
    /// A main process plus a set of worker processes.
    Cluster,
}

impl Default for AppMode {
    fn default() -> Self {
        AppMode::Single
    }
}

/// Fully resolved configuration of a registered application.
///
/// Every field carries a concrete value; defaulting and validation happen
/// before a config is inserted into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub id: u64,
    pub name: String,
    pub path: PathBuf,
    pub interpreter: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mode: AppMode,
    pub instances: u32,
    pub autorestart: bool,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub kill_timeout_ms: u64,
    pub normal_start_ms: u64,
    /// Whether the application should be started when the supervisor boots.
    #[serde(default)]
    pub startup: bool,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub port: PathBuf,
    pub storage: PathBuf,
}

/// Collection of registered application configurations.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn all(&self) -> Result<Vec<AppConfig>>;

    async fn find_by_id(&self, id: u64) -> Result<Option<AppConfig>>;

    async fn find_by_name(&self, name: &str) -> Result<Option<AppConfig>>;

    /// Insert a new config. Fails with a duplicate-name error when another
    /// application already carries the same name.
    async fn insert(&self, config: AppConfig) -> Result<()>;

    /// Replace the stored config with the same id.
    async fn update(&self, config: AppConfig) -> Result<()>;

    /// Persist a new instance count after a scale.
    async fn set_instances(&self, id: u64, instances: u32) -> Result<()>;

    async fn remove(&self, id: u64) -> Result<()>;
}
