use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::CdcResult;
use crate::store::kv::KeyValueStore;

/// Process local key-value store. Checkpoints are lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    async fn set(&self, key: &str, value: &str) -> CdcResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_owned(), value.to_owned());

        Ok(())
    }

    async fn get(&self, key: &str) -> CdcResult<Option<String>> {
        let entries = self.entries.lock().await;

        Ok(entries.get(key).cloned())
    }

    async fn close(&self) -> CdcResult<()> {
        Ok(())
    }
}
