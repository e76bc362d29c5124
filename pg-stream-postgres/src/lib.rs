//! Postgres helpers shared by the pg_stream crates.

pub mod replication;
pub mod time;
pub mod tls;
