use std::future::Future;

use crate::error::CdcResult;

/// String key-value storage backing the checkpoint store.
///
/// Writes overwrite unconditionally and never expire.
pub trait KeyValueStore {
    fn set(&self, key: &str, value: &str) -> impl Future<Output = CdcResult<()>> + Send;

    /// Returns `None` when the key was never written.
    fn get(&self, key: &str) -> impl Future<Output = CdcResult<Option<String>>> + Send;

    /// Releases the underlying connection. Calling it on a store that is not connected, or more
    /// than once, succeeds.
    fn close(&self) -> impl Future<Output = CdcResult<()>> + Send;
}
