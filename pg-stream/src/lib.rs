//! Postgres change-data-capture input.
//!
//! [`input::PgStreamInput`] opens one logical replication session through a
//! [`replication::ReplicationSource`], merges its snapshot and change channels into a single stream
//! of JSON envelopes and persists the position of every acknowledged change in a
//! [`store::checkpoint::CheckpointStore`] so that a restart resumes where the consumer left off.

pub mod concurrency;
pub mod connector;
pub mod conversions;
pub mod error;
pub mod input;
mod macros;
pub mod replication;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

pub use tokio_postgres::types::PgLsn;
