use pg_stream_config::load_config;
use pg_stream_config::shared::PgStreamConfig;

use crate::error::{ReplicatorError, ReplicatorResult};

/// Loads and validates the replicator configuration.
pub fn load_replicator_config() -> ReplicatorResult<PgStreamConfig> {
    let config = load_config::<PgStreamConfig>().map_err(ReplicatorError::config)?;
    config.validate().map_err(ReplicatorError::config)?;

    Ok(config)
}
