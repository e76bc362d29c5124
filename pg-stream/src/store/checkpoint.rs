//! Durable position of each replication slot.
//!
//! One key per slot, `rs_checkpoint_{slot}`, holding the text form of the last acknowledged LSN.
//! Writes are last-write-wins: ordering is enforced by the acknowledgement path in
//! [`crate::input`], not here.

use std::sync::Arc;

use tracing::debug;

use crate::error::CdcResult;
use crate::store::kv::KeyValueStore;

/// Prefix of every checkpoint key.
pub const CHECKPOINT_KEY_PREFIX: &str = "rs_checkpoint_";

#[derive(Debug)]
pub struct CheckpointStore<K> {
    kv: Arc<K>,
}

impl<K> Clone for CheckpointStore<K> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
        }
    }
}

impl<K> CheckpointStore<K>
where
    K: KeyValueStore,
{
    pub fn new(kv: K) -> Self {
        Self { kv: Arc::new(kv) }
    }

    /// Key holding the checkpoint of `slot`.
    pub fn key_for(slot: &str) -> String {
        format!("{CHECKPOINT_KEY_PREFIX}{slot}")
    }

    /// Overwrites the checkpoint of `slot` with `position`.
    pub async fn set_checkpoint(&self, slot: &str, position: &str) -> CdcResult<()> {
        self.kv.set(&Self::key_for(slot), position).await?;
        debug!(slot, position, "checkpoint stored");

        Ok(())
    }

    /// Returns the checkpoint of `slot`.
    ///
    /// `Ok(None)` means the slot was never checkpointed. A store failure is reported as an error
    /// and never as an absent checkpoint.
    pub async fn get_checkpoint(&self, slot: &str) -> CdcResult<Option<String>> {
        self.kv.get(&Self::key_for(slot)).await
    }

    pub async fn close(&self) -> CdcResult<()> {
        self.kv.close().await
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }
}
