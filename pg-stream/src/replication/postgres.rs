use std::time::Duration;

use futures::StreamExt;
use pg_stream_config::shared::PgConnectionConfig;
use postgres_replication::ReplicationStream;
use postgres_replication::protocol::ReplicationMessage;
use tokio::pin;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::conversions::wal2json::parse_transaction;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::client::PgReplicationClient;
use crate::replication::snapshot::SnapshotReader;
use crate::replication::stream::WalEventsStream;
use crate::replication::{ReplicationSession, ReplicationSlot, ReplicationSource, SessionSink};
use crate::types::ChangeEvent;

/// Events buffered on the snapshot channel before the copy waits for the consumer.
pub const DEFAULT_SNAPSHOT_CHANNEL_CAPACITY: usize = 1024;

/// Interval of the forced status updates that keep the walsender from timing out.
const STATUS_UPDATE_TICK: Duration = Duration::from_secs(10);

/// [`ReplicationSource`] over a Postgres `wal2json` logical replication slot.
#[derive(Debug, Clone)]
pub struct PgReplicationSource {
    config: PgConnectionConfig,
    snapshot_capacity: usize,
}

impl PgReplicationSource {
    pub fn new(config: PgConnectionConfig) -> Self {
        Self {
            config,
            snapshot_capacity: DEFAULT_SNAPSHOT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_snapshot_capacity(mut self, snapshot_capacity: usize) -> Self {
        self.snapshot_capacity = snapshot_capacity;
        self
    }
}

impl ReplicationSource for PgReplicationSource {
    async fn connect(
        &self,
        slot: &ReplicationSlot,
        start_lsn: Option<PgLsn>,
    ) -> CdcResult<ReplicationSession> {
        let client = PgReplicationClient::connect(&self.config).await?;
        let slot_result = client
            .get_or_create_slot(slot.server_name(), slot.stream_snapshot())
            .await?;

        // The snapshot has to be imported before the next replication command invalidates it.
        let snapshot = match slot_result.snapshot_name() {
            Some(snapshot_name) => Some(SnapshotReader::begin(&self.config, snapshot_name).await?),
            None => {
                if slot.stream_snapshot() {
                    info!(
                        slot = slot.server_name(),
                        "slot already exists, skipping snapshot"
                    );
                }
                None
            }
        };

        let start_lsn = start_lsn.unwrap_or_else(|| slot_result.start_lsn());
        let stream = client
            .start_replication(slot.server_name(), start_lsn, &slot.qualified_tables())
            .await?;

        let slot = slot.clone();
        let session = ReplicationSession::spawn(self.snapshot_capacity, start_lsn, move |sink| {
            run_session(slot, client, snapshot, stream, sink)
        });

        Ok(session)
    }
}

async fn run_session(
    slot: ReplicationSlot,
    client: PgReplicationClient,
    snapshot: Option<SnapshotReader>,
    stream: ReplicationStream,
    sink: SessionSink,
) -> CdcResult<()> {
    let SessionSink {
        snapshot_tx,
        changes_tx,
        shutdown_rx,
        feedback_rx,
    } = sink;

    let snapshot = copy_snapshot(&slot, snapshot, snapshot_tx, shutdown_rx.clone());
    let changes = stream_changes(&client, stream, changes_tx, shutdown_rx, feedback_rx);
    tokio::try_join!(snapshot, changes)?;

    Ok(())
}

/// Copies the snapshot, if any, and closes the snapshot channel.
async fn copy_snapshot(
    slot: &ReplicationSlot,
    snapshot: Option<SnapshotReader>,
    snapshot_tx: mpsc::Sender<ChangeEvent>,
    mut shutdown_rx: ShutdownRx,
) -> CdcResult<()> {
    let Some(snapshot) = snapshot else {
        return Ok(());
    };

    info!(slot = slot.server_name(), tables = ?slot.tables(), "starting snapshot");
    match snapshot
        .copy_tables(slot, &snapshot_tx, &mut shutdown_rx)
        .await?
    {
        ShutdownResult::Ok(rows) => info!(slot = slot.server_name(), rows, "snapshot completed"),
        ShutdownResult::Shutdown(rows) => {
            info!(slot = slot.server_name(), rows, "snapshot stopped before completion")
        }
    }

    Ok(())
}

/// Decodes the replication stream onto the change channel until shutdown.
async fn stream_changes(
    client: &PgReplicationClient,
    stream: ReplicationStream,
    changes_tx: mpsc::UnboundedSender<ChangeEvent>,
    mut shutdown_rx: ShutdownRx,
    mut feedback_rx: watch::Receiver<PgLsn>,
) -> CdcResult<()> {
    let stream = WalEventsStream::wrap(stream);
    pin!(stream);

    let mut last_received = *feedback_rx.borrow_and_update();
    let mut feedback_open = true;

    let mut status_ticker = tokio::time::interval(STATUS_UPDATE_TICK);
    status_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                info!("shutting down replication stream");
                return Ok(());
            }

            changed = feedback_rx.changed(), if feedback_open => {
                if changed.is_err() {
                    feedback_open = false;
                    continue;
                }

                let flush_lsn = *feedback_rx.borrow_and_update();
                last_received = last_received.max(flush_lsn);
                stream
                    .as_mut()
                    .send_status_update(last_received, flush_lsn, false)
                    .await?;
            }

            _ = status_ticker.tick() => {
                let flush_lsn = *feedback_rx.borrow();
                stream
                    .as_mut()
                    .send_status_update(last_received.max(flush_lsn), flush_lsn, true)
                    .await?;
            }

            message = stream.next() => {
                let Some(message) = message else {
                    if client.is_closed() {
                        bail!(
                            ErrorKind::SourceConnectionFailed,
                            "Postgres connection closed during replication"
                        );
                    }
                    bail!(
                        ErrorKind::SourceConnectionFailed,
                        "Replication stream ended unexpectedly"
                    );
                };

                match message? {
                    ReplicationMessage::XLogData(body) => {
                        let received_lsn = PgLsn::from(body.wal_start());
                        last_received = last_received.max(PgLsn::from(body.wal_end()));

                        let events = parse_transaction(body.data(), received_lsn)?;
                        if let Some(commit_lsn) = events.last().and_then(|event| event.lsn) {
                            last_received = last_received.max(commit_lsn);
                        }
                        debug!(%received_lsn, events = events.len(), "decoded transaction");

                        for event in events {
                            if changes_tx.send(event).is_err() {
                                warn!("change channel closed, stopping replication stream");
                                return Ok(());
                            }
                        }
                    }
                    ReplicationMessage::PrimaryKeepAlive(keepalive) => {
                        last_received = last_received.max(PgLsn::from(keepalive.wal_end()));

                        if keepalive.reply() == 1 {
                            let flush_lsn = *feedback_rx.borrow();
                            stream
                                .as_mut()
                                .send_status_update(last_received, flush_lsn, true)
                                .await?;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
