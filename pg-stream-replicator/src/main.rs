//! pg_stream replicator binary.
//!
//! Streams changes of the configured Postgres tables to stdout, one JSON document per line, and
//! checkpoints every line once it is written. Logs go to stderr.

use pg_stream_config::shared::PgStreamConfig;
use pg_stream_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_replicator_config;
use crate::core::start_replicator_with_config;
use crate::error::{ReplicatorError, ReplicatorResult};

mod config;
mod core;
mod error;
mod retry;

fn main() -> ReplicatorResult<()> {
    let replicator_config = match load_replicator_config() {
        Ok(config) => config,
        Err(err) => {
            // Tracing is not installed yet.
            eprint!("{}", err.render_report());
            return Err(err);
        }
    };

    let _log_flusher =
        init_tracing(env!("CARGO_BIN_NAME")).map_err(ReplicatorError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))?;

    Ok(())
}

async fn async_main(replicator_config: PgStreamConfig) -> ReplicatorResult<()> {
    if let Err(err) = start_replicator_with_config(replicator_config).await {
        error!(category = err.category(), "{err}");
        eprint!("{}", err.render_report());
        return Err(err);
    }

    Ok(())
}
