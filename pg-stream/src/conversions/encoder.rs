use std::fmt;

use bytes::Bytes;

use crate::cdc_error;
use crate::error::{CdcResult, ErrorKind};
use crate::types::ChangeEvent;

/// Converts a [`ChangeEvent`] into the payload of a message.
///
/// A failure is reported for that event only, the session keeps running.
pub trait EventEncoder: fmt::Debug + Send + Sync {
    fn encode(&self, event: &ChangeEvent) -> CdcResult<Bytes>;
}

/// Encodes events as compact wal2json style JSON objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventEncoder;

impl EventEncoder for JsonEventEncoder {
    fn encode(&self, event: &ChangeEvent) -> CdcResult<Bytes> {
        let payload = serde_json::to_vec(event).map_err(|err| {
            cdc_error!(
                ErrorKind::SerializationError,
                "Change event could not be encoded",
                format!("{} change on {}", event.kind, event.qualified_table()),
                source: err
            )
        })?;

        Ok(Bytes::from(payload))
    }
}
