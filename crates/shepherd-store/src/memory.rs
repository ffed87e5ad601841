//! In-memory store implementations, used by tests and embedders that do not
//! need persistence.

use crate::config::{AppConfig, ConfigStore};
use crate::runtime::{RuntimeRecord, RuntimeStore};
use async_trait::async_trait;
use shepherd_common::{Error, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryConfigStore {
    map: Mutex<HashMap<u64, AppConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn all(&self) -> Result<Vec<AppConfig>> {
        let mut configs: Vec<_> = self.map.lock().await.values().cloned().collect();
        configs.sort_by_key(|c| c.id);
        Ok(configs)
    }

    async fn find_by_id(&self, id: u64) -> Result<Option<AppConfig>> {
        Ok(self.map.lock().await.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<AppConfig>> {
        Ok(self
            .map
            .lock()
            .await
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn insert(&self, config: AppConfig) -> Result<()> {
        let mut map = self.map.lock().await;
        if map.values().any(|c| c.name == config.name) {
            return Err(Error::duplicate_name(&config.name));
        }
        map.insert(config.id, config);
        Ok(())
    }

    async fn update(&self, config: AppConfig) -> Result<()> {
        let mut map = self.map.lock().await;
        if !map.contains_key(&config.id) {
            return Err(Error::no_such_application(config.id.to_string()));
        }
        map.insert(config.id, config);
        Ok(())
    }

    async fn set_instances(&self, id: u64, instances: u32) -> Result<()> {
        if let Some(config) = self.map.lock().await.get_mut(&id) {
            config.instances = instances;
        }
        Ok(())
    }

    async fn remove(&self, id: u64) -> Result<()> {
        self.map.lock().await.remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRuntimeStore {
    map: Mutex<HashMap<u64, RuntimeRecord>>,
}

impl MemoryRuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStore for MemoryRuntimeStore {
    async fn all(&self) -> Result<Vec<RuntimeRecord>> {
        let mut records: Vec<_> = self.map.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn find(&self, id: u64) -> Result<Option<RuntimeRecord>> {
        Ok(self.map.lock().await.get(&id).cloned())
    }

    async fn upsert(&self, record: RuntimeRecord) -> Result<()> {
        self.map.lock().await.insert(record.id, record);
        Ok(())
    }

    async fn mark_attached(&self, id: u64, at: i64) -> Result<()> {
        if let Some(record) = self.map.lock().await.get_mut(&id) {
            record.timestamps.attached = Some(at);
        }
        Ok(())
    }

    async fn remove(&self, id: u64) -> Result<()> {
        self.map.lock().await.remove(&id);
        Ok(())
    }
}
