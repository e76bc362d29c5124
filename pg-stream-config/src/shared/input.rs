use serde::Deserialize;

use crate::Config;
use crate::shared::{
    CheckpointStoreConfig, PgConnectionConfig, RetryConfig, StreamConfig, ValidationError,
};

/// Complete configuration of a pg_stream input.
///
/// Does not implement `Serialize` so secrets cannot leak through a serialized form.
#[derive(Debug, Clone, Deserialize)]
pub struct PgStreamConfig {
    pub source: PgConnectionConfig,
    pub stream: StreamConfig,
    #[serde(default)]
    pub checkpoint: CheckpointStoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl PgStreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.stream.validate()?;
        self.checkpoint.validate()?;
        self.retry.validate()
    }
}

impl Config for PgStreamConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["stream.tables"];
}
