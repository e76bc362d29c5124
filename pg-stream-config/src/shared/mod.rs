//! Configuration types shared by the connector library and the replicator binary.

mod base;
mod checkpoint;
mod connection;
mod input;
mod retry;
mod stream;

pub use base::ValidationError;
pub use checkpoint::{CheckpointStoreConfig, DEFAULT_REDIS_PORT};
pub use connection::{
    DEFAULT_PG_PORT, DefaultPgConnectionOptions, IntoConnectOptions, PgConnectionConfig, TlsMode,
};
pub use input::PgStreamConfig;
pub use retry::RetryConfig;
pub use stream::{
    DEFAULT_SNAPSHOT_MEMORY_SAFETY_FACTOR, MAX_SLOT_NAME_LENGTH, SLOT_NAME_PREFIX, StreamConfig,
    validate_slot_name,
};
