//! Configuration for the pg_stream connector.
//!
//! Types are grouped under [`shared`]; [`load_config`] assembles them from configuration files and
//! `APP_`-prefixed environment variables.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
