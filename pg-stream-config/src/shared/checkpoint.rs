use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Default Redis port.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Where acknowledged positions are persisted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CheckpointStoreConfig {
    /// Keeps checkpoints in process memory. Restarts begin from the slot's confirmed position.
    #[default]
    Memory,
    /// Persists checkpoints in Redis.
    Redis {
        host: String,
        #[serde(default = "default_redis_port")]
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<SecretString>,
    },
}

fn default_redis_port() -> u16 {
    DEFAULT_REDIS_PORT
}

impl CheckpointStoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            CheckpointStoreConfig::Memory => Ok(()),
            CheckpointStoreConfig::Redis { host, .. } if host.trim().is_empty() => {
                Err(ValidationError::EmptyField("checkpoint.host"))
            }
            CheckpointStoreConfig::Redis { .. } => Ok(()),
        }
    }
}
