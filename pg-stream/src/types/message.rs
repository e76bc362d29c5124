use bytes::Bytes;
use tokio_postgres::types::PgLsn;

use crate::types::EventSource;

/// Encoded change event handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Bytes,
    source: EventSource,
    lsn: Option<PgLsn>,
}

impl Message {
    pub fn new(payload: Bytes, source: EventSource, lsn: Option<PgLsn>) -> Self {
        Self {
            payload,
            source,
            lsn,
        }
    }

    /// Encoded event.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    /// Position committed to the checkpoint store when this message is acknowledged.
    pub fn lsn(&self) -> Option<PgLsn> {
        self.lsn
    }
}
