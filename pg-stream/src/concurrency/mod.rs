//! Coordination primitives shared by the input and the replication session task.
//!
//! [`shutdown`] carries cancellation from the caller into `read` and from the connector into the
//! background session. [`memory`] sizes snapshot batches from the memory the process may use.

pub mod memory;
pub mod shutdown;
