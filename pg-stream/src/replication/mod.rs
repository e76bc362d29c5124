//! Replication session establishment.
//!
//! [`ReplicationSource`] is the seam between the connector and the database: it turns a
//! [`ReplicationSlot`] into a running [`ReplicationSession`] whose background task feeds the
//! snapshot and change channels. [`postgres::PgReplicationSource`] implements it on top of a
//! `wal2json` logical replication slot.

pub mod client;
pub mod postgres;
mod session;
mod slot;
pub mod snapshot;
pub mod stream;

pub use session::{ReplicationFeedback, ReplicationSession, ReplicationSource, SessionSink};
pub use slot::ReplicationSlot;
