use std::io;

use pg_stream::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use pg_stream::error::ErrorKind;
use pg_stream::input::{PgStreamInput, ReadResult};
use pg_stream::replication::{ReplicationSlot, ReplicationSource};
use pg_stream::replication::postgres::PgReplicationSource;
use pg_stream::store::checkpoint::CheckpointStore;
use pg_stream::store::kv::{KeyValueStore, MemoryKeyValueStore, RedisKeyValueStore};
use pg_stream_config::shared::{
    CheckpointStoreConfig, PgConnectionConfig, PgStreamConfig, RetryConfig, StreamConfig,
};
use pg_stream_postgres::replication::slots::RandomSlotNameGenerator;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ReplicatorResult;
use crate::retry::Backoff;

/// Streams the configured tables to stdout as JSON lines until a shutdown signal arrives or the
/// replication session ends.
pub async fn start_replicator_with_config(config: PgStreamConfig) -> ReplicatorResult<()> {
    info!("starting replicator");
    log_config(&config);

    let slot = ReplicationSlot::resolve(&config.stream, &RandomSlotNameGenerator)?;
    info!(slot = slot.name(), server_slot = slot.server_name(), "replication slot resolved");

    let source = PgReplicationSource::new(config.source.clone());
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let signal_handle = spawn_signal_listener(shutdown_tx);

    // Static dispatch over the checkpoint backends.
    let result = match &config.checkpoint {
        CheckpointStoreConfig::Memory => {
            let checkpoints = CheckpointStore::new(MemoryKeyValueStore::new());
            let input = PgStreamInput::new(source, slot, checkpoints);
            run_input(input, &config.retry, shutdown_rx).await
        }
        CheckpointStoreConfig::Redis {
            host,
            port,
            username,
            password,
        } => {
            let kv = RedisKeyValueStore::connect(
                host.clone(),
                *port,
                username.clone(),
                password.clone(),
            )
            .await?;
            let input = PgStreamInput::new(source, slot, CheckpointStore::new(kv));
            run_input(input, &config.retry, shutdown_rx).await
        }
    };

    signal_handle.abort();
    let _ = signal_handle.await;

    result?;
    info!("replicator stopped");

    Ok(())
}

async fn run_input<R, K>(
    mut input: PgStreamInput<R, K>,
    retry: &RetryConfig,
    mut shutdown_rx: ShutdownRx,
) -> ReplicatorResult<()>
where
    R: ReplicationSource,
    K: KeyValueStore,
{
    let connected = match connect_with_retry(&mut input, retry, &mut shutdown_rx).await {
        Ok(connected) => connected,
        Err(err) => {
            // The connect error is the one worth reporting.
            if let Err(close_err) = input.close().await {
                warn!(error = %close_err, "failed to close input after connect failure");
            }
            return Err(err);
        }
    };

    let forwarded = if connected {
        let mut stdout = tokio::io::stdout();
        forward_messages(&mut input, &mut shutdown_rx, &mut stdout).await
    } else {
        Ok(0)
    };
    let closed = input.close().await;

    let count = forwarded?;
    closed?;
    info!(messages = count, "input drained");

    Ok(())
}

/// Connects `input`, retrying transient failures with backoff.
///
/// Returns `false` when a shutdown signal arrived while waiting for the next attempt.
pub async fn connect_with_retry<R, K>(
    input: &mut PgStreamInput<R, K>,
    config: &RetryConfig,
    shutdown_rx: &mut ShutdownRx,
) -> ReplicatorResult<bool>
where
    R: ReplicationSource,
    K: KeyValueStore,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 1u32;

    loop {
        let err = match input.connect().await {
            Ok(()) => return Ok(true),
            Err(err) => err,
        };

        if !err.kind().is_transient() {
            return Err(err.into());
        }
        let Some(delay) = backoff.next_delay() else {
            error!(attempt, error = %err, "giving up connecting");
            return Err(err.into());
        };

        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "connect failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            Ok(()) = shutdown_rx.changed() => {
                info!("shutdown requested while waiting to reconnect");
                return Ok(false);
            }
        }
        attempt += 1;
    }
}

/// Writes every message as one line to `writer`, acknowledging it once the line is flushed.
///
/// Messages that cannot be encoded are skipped. Returns how many messages were written.
pub async fn forward_messages<R, K, W>(
    input: &mut PgStreamInput<R, K>,
    shutdown_rx: &mut ShutdownRx,
    writer: &mut W,
) -> ReplicatorResult<u64>
where
    R: ReplicationSource,
    K: KeyValueStore,
    W: AsyncWrite + Unpin,
{
    let mut count = 0;

    loop {
        let (message, ack) = match input.read(shutdown_rx).await {
            Ok(ReadResult::Message(message, ack)) => (message, ack),
            Ok(ReadResult::EndOfStream) => {
                info!("end of stream reached");
                return Ok(count);
            }
            Err(err) if err.kind() == ErrorKind::SerializationError => {
                warn!(error = %err, "skipping event that could not be encoded");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        match write_line(writer, message.payload()).await {
            Ok(()) => {
                ack.ack(Ok::<(), io::Error>(())).await?;
                count += 1;
            }
            Err(err) => {
                ack.ack(Err(&err)).await?;
                return Err(err.into());
            }
        }
    }
}

async fn write_line<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Fires `shutdown_tx` on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown_tx: ShutdownTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;

        if let Err(err) = shutdown_tx.shutdown() {
            warn!(error = ?err, "failed to send shutdown signal");
        }
    })
}

async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "failed to register sigterm handler, only ctrl+c stops the replicator");
            ctrl_c().await;
            info!("sigint (ctrl+c) received, shutting down");
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {
            info!("sigint (ctrl+c) received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("sigterm received, shutting down");
        }
    }
}

/// Resolves on ctrl+c. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl+c");
        std::future::pending::<()>().await;
    }
}

fn log_config(config: &PgStreamConfig) {
    log_pg_connection_config(&config.source);
    log_stream_config(&config.stream);
    log_checkpoint_config(&config.checkpoint);
    debug!(
        max_attempts = config.retry.max_attempts,
        initial_delay_ms = config.retry.initial_delay_ms,
        max_delay_ms = config.retry.max_delay_ms,
        backoff_multiplier = config.retry.backoff_multiplier,
        "retry config"
    );
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        database = config.database,
        user = config.user,
        tls = ?config.tls,
        "source postgres connection config"
    );
}

fn log_stream_config(config: &StreamConfig) {
    debug!(
        schema = config.schema,
        tables = ?config.tables,
        stream_snapshot = config.stream_snapshot,
        snapshot_memory_safety_factor = config.snapshot_memory_safety_factor,
        slot_name = ?config.slot_name,
        "stream config"
    );
}

fn log_checkpoint_config(config: &CheckpointStoreConfig) {
    match config {
        CheckpointStoreConfig::Memory => debug!("using memory checkpoint store"),
        CheckpointStoreConfig::Redis {
            host,
            port,
            username,
            password: _,
        } => debug!(host, port, username = ?username, "using redis checkpoint store"),
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use pg_stream::test_utils::event::{insert_event, lsn, slot, update_event};
    use pg_stream::test_utils::source::ScriptedReplicationSource;
    use pg_stream::types::ChangeEvent;

    use super::*;
    use crate::error::ReplicatorError;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn forwards_one_line_per_event_and_checkpoints_changes() {
        let source = ScriptedReplicationSource::new()
            .with_snapshot(vec![insert_event("orders", 1)])
            .with_changes(vec![update_event("orders", 1, Some(lsn("0/3000")))])
            .ending_after_changes();
        let checkpoints = CheckpointStore::new(MemoryKeyValueStore::new());
        let mut input = PgStreamInput::new(source, slot("orders_slot"), checkpoints.clone());
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();
        input.connect().await.unwrap();

        let mut output = Vec::new();
        let count = forward_messages(&mut input, &mut shutdown_rx, &mut output)
            .await
            .unwrap();

        assert_eq!(count, 2);
        let lines: Vec<ChangeEvent> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines[0], insert_event("orders", 1));
        assert_eq!(lines[1], update_event("orders", 1, Some(lsn("0/3000"))));
        assert_eq!(
            checkpoints.get_checkpoint("orders_slot").await.unwrap(),
            Some("0/3000".to_owned())
        );

        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_write_is_not_checkpointed() {
        let source = ScriptedReplicationSource::new()
            .with_changes(vec![update_event("orders", 1, Some(lsn("0/3000")))]);
        let checkpoints = CheckpointStore::new(MemoryKeyValueStore::new());
        let mut input = PgStreamInput::new(source, slot("orders_slot"), checkpoints.clone());
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();
        input.connect().await.unwrap();

        let err = forward_messages(&mut input, &mut shutdown_rx, &mut BrokenPipe)
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicatorError::Io(_, _)));
        assert_eq!(checkpoints.get_checkpoint("orders_slot").await.unwrap(), None);

        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn transient_connect_failures_are_retried_until_attempts_run_out() {
        let source =
            ScriptedReplicationSource::new().failing_with(ErrorKind::SourceConnectionFailed);
        let mut input = PgStreamInput::new(
            source.clone(),
            slot("orders_slot"),
            CheckpointStore::new(MemoryKeyValueStore::new()),
        );
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();

        let err = connect_with_retry(&mut input, &fast_retry(3), &mut shutdown_rx)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReplicatorError::Cdc(ref err) if err.kind() == ErrorKind::SourceConnectionFailed
        ));
        assert_eq!(source.connects(), 3);
    }

    #[tokio::test]
    async fn permanent_connect_failures_are_not_retried() {
        let source = ScriptedReplicationSource::new().failing_with(ErrorKind::AuthenticationError);
        let mut input = PgStreamInput::new(
            source.clone(),
            slot("orders_slot"),
            CheckpointStore::new(MemoryKeyValueStore::new()),
        );
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();

        assert!(
            connect_with_retry(&mut input, &fast_retry(5), &mut shutdown_rx)
                .await
                .is_err()
        );
        assert_eq!(source.connects(), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let source =
            ScriptedReplicationSource::new().failing_with(ErrorKind::SourceConnectionFailed);
        let mut input = PgStreamInput::new(
            source.clone(),
            slot("orders_slot"),
            CheckpointStore::new(MemoryKeyValueStore::new()),
        );
        let (shutdown_tx, mut shutdown_rx) = create_shutdown_channel();
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 1.0,
        };
        shutdown_tx.shutdown().unwrap();

        let connected = connect_with_retry(&mut input, &retry, &mut shutdown_rx)
            .await
            .unwrap();

        assert!(!connected);
        assert_eq!(source.connects(), 1);
    }
}
