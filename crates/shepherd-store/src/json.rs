//! JSON-file backed store implementations.
//!
//! Each store keeps its whole collection in memory and rewrites a single
//! JSON document on every mutation. Writes go through a temp file followed
//! by a rename so a crash never leaves a truncated document behind.

use crate::config::{AppConfig, ConfigStore};
use crate::runtime::{RuntimeRecord, RuntimeStore};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shepherd_common::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

async fn load_map<T: DeserializeOwned>(path: &Path) -> Result<HashMap<u64, T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let entries: Vec<(u64, T)> = serde_json::from_slice(&bytes)
                .map_err(|e| Error::store(format!("corrupt store file {}: {e}", path.display())))?;
            Ok(entries.into_iter().collect())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

async fn persist_map<T: Serialize>(path: &Path, map: &HashMap<u64, T>) -> Result<()> {
    let mut entries: Vec<(&u64, &T)> = map.iter().collect();
    entries.sort_by_key(|(id, _)| **id);
    let bytes = serde_json::to_vec_pretty(&entries)
        .map_err(|e| Error::store(format!("failed to serialize store: {e}")))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// [`ConfigStore`] persisted to one JSON file.
pub struct JsonConfigStore {
    path: PathBuf,
    cache: Mutex<Option<HashMap<u64, AppConfig>>>,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    async fn with_map<R>(
        &self,
        f: impl FnOnce(&mut HashMap<u64, AppConfig>) -> R,
        persist: bool,
    ) -> Result<R> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(load_map(&self.path).await?);
        }
        let map = guard.as_mut().ok_or_else(|| Error::store("cache vanished"))?;
        let out = f(map);
        if persist {
            persist_map(&self.path, map).await?;
            debug!(path = %self.path.display(), entries = map.len(), "configs persisted");
        }
        Ok(out)
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn all(&self) -> Result<Vec<AppConfig>> {
        let mut configs = self
            .with_map(|map| map.values().cloned().collect::<Vec<_>>(), false)
            .await?;
        configs.sort_by_key(|c| c.id);
        Ok(configs)
    }

    async fn find_by_id(&self, id: u64) -> Result<Option<AppConfig>> {
        self.with_map(|map| map.get(&id).cloned(), false).await
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<AppConfig>> {
        self.with_map(
            |map| map.values().find(|c| c.name == name).cloned(),
            false,
        )
        .await
    }

    async fn insert(&self, config: AppConfig) -> Result<()> {
        self.with_map(
            |map| {
                if map.values().any(|c| c.name == config.name) {
                    return Err(Error::duplicate_name(&config.name));
                }
                map.insert(config.id, config);
                Ok(())
            },
            true,
        )
        .await?
    }

    async fn update(&self, config: AppConfig) -> Result<()> {
        self.with_map(
            |map| {
                if !map.contains_key(&config.id) {
                    return Err(Error::no_such_application(config.id.to_string()));
                }
                map.insert(config.id, config);
                Ok(())
            },
            true,
        )
        .await?
    }

    async fn set_instances(&self, id: u64, instances: u32) -> Result<()> {
        self.with_map(
            |map| {
                if let Some(config) = map.get_mut(&id) {
                    config.instances = instances;
                }
            },
            true,
        )
        .await
    }

    async fn remove(&self, id: u64) -> Result<()> {
        self.with_map(
            |map| {
                map.remove(&id);
            },
            true,
        )
        .await
    }
}

/// [`RuntimeStore`] persisted to one JSON file.
pub struct JsonRuntimeStore {
    path: PathBuf,
    cache: Mutex<Option<HashMap<u64, RuntimeRecord>>>,
}

impl JsonRuntimeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    async fn with_map<R>(
        &self,
        f: impl FnOnce(&mut HashMap<u64, RuntimeRecord>) -> R,
        persist: bool,
    ) -> Result<R> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(load_map(&self.path).await?);
        }
        let map = guard.as_mut().ok_or_else(|| Error::store("cache vanished"))?;
        let out = f(map);
        if persist {
            persist_map(&self.path, map).await?;
        }
        Ok(out)
    }
}

#[async_trait]
impl RuntimeStore for JsonRuntimeStore {
    async fn all(&self) -> Result<Vec<RuntimeRecord>> {
        let mut records = self
            .with_map(|map| map.values().cloned().collect::<Vec<_>>(), false)
            .await?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn find(&self, id: u64) -> Result<Option<RuntimeRecord>> {
        self.with_map(|map| map.get(&id).cloned(), false).await
    }

    async fn upsert(&self, record: RuntimeRecord) -> Result<()> {
        self.with_map(
            |map| {
                map.insert(record.id, record);
            },
            true,
        )
        .await
    }

    async fn mark_attached(&self, id: u64, at: i64) -> Result<()> {
        self.with_map(
            |map| {
                if let Some(record) = map.get_mut(&id) {
                    record.timestamps.attached = Some(at);
                }
            },
            true,
        )
        .await
    }

    async fn remove(&self, id: u64) -> Result<()> {
        self.with_map(
            |map| {
                map.remove(&id);
            },
            true,
        )
        .await
    }
}
