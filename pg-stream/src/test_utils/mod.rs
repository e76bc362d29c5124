//! In-memory doubles for exercising the input without Postgres or Redis.

pub mod event;
pub mod kv;
pub mod source;
