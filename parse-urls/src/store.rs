use anyhow::Result;
use async_trait::async_trait;
use interfaces::state::TaskStore;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// In-process [`TaskStore`]. State lives as long as the value does.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, task: &str, key: &str) -> Result<Option<Value>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(task).and_then(|entries| entries.get(key)).cloned())
    }

    async fn set(&self, task: &str, key: &str, value: Value) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks
            .entry(task.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, task: &str, key: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(entries) = tasks.get_mut(task) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, task: &str, prefix: &str) -> Result<Vec<String>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .get(task)
            .map(|entries| {
                entries
                    .keys()
                    .filter(|key| key.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
