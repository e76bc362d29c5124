use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::store::kv::{KeyValueStore, MemoryKeyValueStore};

#[derive(Debug, Default)]
struct Recorded {
    writes: Mutex<Vec<(String, String)>>,
    closes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_close: AtomicBool,
}

/// [`MemoryKeyValueStore`] that records writes and closes and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingKeyValueStore {
    entries: MemoryKeyValueStore,
    recorded: Arc<Recorded>,
}

impl RecordingKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.recorded
            .writes
            .lock()
            .map(|writes| writes.clone())
            .unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.writes().len()
    }

    pub fn closes(&self) -> usize {
        self.recorded.closes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.recorded.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.recorded.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.recorded.fail_close.store(fail, Ordering::SeqCst);
    }
}

impl KeyValueStore for RecordingKeyValueStore {
    async fn set(&self, key: &str, value: &str) -> CdcResult<()> {
        if self.recorded.fail_writes.load(Ordering::SeqCst) {
            bail!(ErrorKind::CheckpointWriteFailed, "Scripted write failure", key);
        }

        self.entries.set(key, value).await?;
        if let Ok(mut writes) = self.recorded.writes.lock() {
            writes.push((key.to_owned(), value.to_owned()));
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> CdcResult<Option<String>> {
        if self.recorded.fail_reads.load(Ordering::SeqCst) {
            bail!(ErrorKind::CheckpointReadFailed, "Scripted read failure", key);
        }

        self.entries.get(key).await
    }

    async fn close(&self) -> CdcResult<()> {
        self.recorded.closes.fetch_add(1, Ordering::SeqCst);
        if self.recorded.fail_close.load(Ordering::SeqCst) {
            bail!(ErrorKind::CheckpointStoreCloseFailed, "Scripted close failure");
        }

        Ok(())
    }
}
