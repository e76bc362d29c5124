//! Logging setup shared by the pg_stream binaries and tests.

pub mod tracing;
