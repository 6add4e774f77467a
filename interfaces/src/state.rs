use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Durable key/value storage, namespaced per task. Values are small JSON
/// documents.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, task: &str, key: &str) -> Result<Option<Value>>;

    async fn set(&self, task: &str, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, task: &str, key: &str) -> Result<()>;

    /// Keys of `task` starting with `prefix`, in ascending order.
    async fn keys(&self, task: &str, prefix: &str) -> Result<Vec<String>>;
}
