//! The consumer-facing input.
//!
//! [`PgStreamInput`] connects a [`StreamConnector`] to a [`CheckpointStore`]:
//!
//! - [`PgStreamInput::connect`] resumes from the slot's checkpoint.
//! - [`PgStreamInput::read`] returns one encoded event at a time, taken fairly from the snapshot
//!   and change channels, each with an [`Acknowledger`].
//! - Acknowledging a change that closes a transaction stores its position.
//! - [`PgStreamInput::close`] releases the session and the store.
//!
//! One `read` completes before the next starts. Events of one channel keep their order, events of
//! different channels may interleave arbitrarily.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::connector::{ConnectorState, StreamConnector};
use crate::conversions::encoder::{EventEncoder, JsonEventEncoder};
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::replication::{ReplicationFeedback, ReplicationSlot, ReplicationSource};
use crate::store::checkpoint::CheckpointStore;
use crate::store::kv::KeyValueStore;
use crate::types::{ChangeEvent, EventSource, Message};
use crate::{bail, cdc_error};

/// Outcome of [`PgStreamInput::read`].
#[derive(Debug)]
pub enum ReadResult<K> {
    Message(Message, Acknowledger<K>),
    /// No further message will be returned by this input.
    EndOfStream,
}

enum Received {
    Event(ChangeEvent, EventSource),
    Cancelled,
    Exhausted,
}

/// Stores acknowledged positions, never moving the checkpoint backwards.
struct CheckpointCommitter<K> {
    store: CheckpointStore<K>,
    slot: String,
    committed: Mutex<Option<PgLsn>>,
    feedback: Option<ReplicationFeedback>,
}

impl<K> CheckpointCommitter<K>
where
    K: KeyValueStore,
{
    async fn commit(&self, lsn: PgLsn) -> CdcResult<()> {
        let mut committed = self.committed.lock().await;
        if let Some(current) = *committed
            && lsn < current
        {
            debug!(slot = %self.slot, %lsn, %current, "ignoring acknowledgement of an older position");
            return Ok(());
        }

        self.store.set_checkpoint(&self.slot, &lsn.to_string()).await?;
        *committed = Some(lsn);

        if let Some(feedback) = &self.feedback {
            feedback.confirm(lsn);
        }

        Ok(())
    }
}

impl<K> fmt::Debug for CheckpointCommitter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCommitter")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum AckTarget<K> {
    Snapshot,
    Change {
        committer: Arc<CheckpointCommitter<K>>,
        lsn: Option<PgLsn>,
    },
}

/// Acknowledgement of one message returned by [`PgStreamInput::read`].
///
/// It may outlive the read that produced it and be used from another task.
#[derive(Debug)]
pub struct Acknowledger<K> {
    target: AckTarget<K>,
}

impl<K> Acknowledger<K>
where
    K: KeyValueStore,
{
    /// Reports how processing the message went.
    ///
    /// On success, a change that carries a position writes that position to the checkpoint
    /// store, and a store failure is returned to signal that progress was not recorded. Snapshot
    /// messages and failed processing never touch the store; a failed message is expected to be
    /// redelivered from the last checkpoint.
    pub async fn ack<E>(self, result: Result<(), E>) -> CdcResult<()>
    where
        E: fmt::Display,
    {
        let AckTarget::Change { committer, lsn } = self.target else {
            return Ok(());
        };

        if let Err(err) = result {
            warn!(
                slot = %committer.slot,
                lsn = ?lsn.map(|lsn| lsn.to_string()),
                error = %err,
                "change was not processed, checkpoint not advanced"
            );
            return Ok(());
        }

        match lsn {
            Some(lsn) => committer.commit(lsn).await,
            None => Ok(()),
        }
    }
}

/// Postgres change-data-capture input with acknowledgement driven checkpoints.
pub struct PgStreamInput<R, K> {
    connector: StreamConnector<R>,
    checkpoints: CheckpointStore<K>,
    encoder: Arc<dyn EventEncoder>,
    committer: Option<Arc<CheckpointCommitter<K>>>,
    snapshot_done: bool,
    changes_done: bool,
    stop_error: Option<CdcError>,
}

impl<R, K> PgStreamInput<R, K>
where
    R: ReplicationSource,
    K: KeyValueStore,
{
    pub fn new(source: R, slot: ReplicationSlot, checkpoints: CheckpointStore<K>) -> Self {
        Self {
            connector: StreamConnector::new(source, slot),
            checkpoints,
            encoder: Arc::new(JsonEventEncoder),
            committer: None,
            snapshot_done: false,
            changes_done: false,
            stop_error: None,
        }
    }

    /// Replaces the default JSON encoding of events.
    pub fn with_encoder<E>(mut self, encoder: E) -> Self
    where
        E: EventEncoder + 'static,
    {
        self.encoder = Arc::new(encoder);
        self
    }

    pub fn state(&self) -> ConnectorState {
        self.connector.state()
    }

    pub fn slot(&self) -> &ReplicationSlot {
        self.connector.slot()
    }

    pub fn connector(&self) -> &StreamConnector<R> {
        &self.connector
    }

    /// Opens the replication session, resuming after the slot's checkpoint.
    ///
    /// A checkpoint that cannot be read fails the connect instead of being taken as absent. Use
    /// [`PgStreamInput::connect_from`] to choose the start position explicitly in that case.
    pub async fn connect(&mut self) -> CdcResult<()> {
        self.connector.ensure_connectable()?;

        let slot_name = self.connector.slot().name().to_owned();
        let start_lsn = match self.checkpoints.get_checkpoint(&slot_name).await? {
            Some(position) => {
                let lsn = position.parse::<PgLsn>().map_err(|_| {
                    cdc_error!(
                        ErrorKind::ConversionError,
                        "Stored checkpoint is not a valid position",
                        format!("checkpoint of slot '{slot_name}' is '{position}'")
                    )
                })?;
                info!(slot = %slot_name, %lsn, "resuming from checkpoint");

                Some(lsn)
            }
            None => {
                info!(slot = %slot_name, "no checkpoint stored, starting from the slot position");

                None
            }
        };

        self.connect_from(start_lsn).await
    }

    /// Opens the replication session from `start_lsn`, or from the position the source tracks
    /// for the slot when `None`.
    pub async fn connect_from(&mut self, start_lsn: Option<PgLsn>) -> CdcResult<()> {
        self.connector.connect(start_lsn).await?;

        self.committer = Some(Arc::new(CheckpointCommitter {
            store: self.checkpoints.clone(),
            slot: self.connector.slot().name().to_owned(),
            committed: Mutex::new(start_lsn),
            feedback: self.connector.feedback(),
        }));
        self.snapshot_done = false;
        self.changes_done = false;

        Ok(())
    }

    /// Waits for the next event or for `cancellation`.
    ///
    /// Cancellation stops the session and returns [`ReadResult::EndOfStream`], as does every
    /// later call. A dropped cancellation sender never fires. When the session ends on its own
    /// the session's error is returned once, then end of stream. An event that cannot be encoded
    /// fails this call only.
    pub async fn read(&mut self, cancellation: &mut ShutdownRx) -> CdcResult<ReadResult<K>> {
        match self.connector.state() {
            ConnectorState::Streaming => {}
            ConnectorState::Draining => return Ok(ReadResult::EndOfStream),
            ConnectorState::Closed => bail!(ErrorKind::ConnectorClosed, "Input is closed"),
            ConnectorState::Idle | ConnectorState::Connecting => {
                bail!(ErrorKind::InvalidState, "Input is not connected")
            }
        }

        let received = self.receive(cancellation).await?;

        match received {
            Received::Event(event, source) => self.envelope(event, source).map(|(message, ack)| {
                ReadResult::Message(message, ack)
            }),
            Received::Cancelled => {
                info!(slot = self.connector.slot().name(), "read cancelled, stopping session");
                if let Err(err) = self.connector.stop().await {
                    warn!(error = %err, "replication session failed while stopping");
                    self.stop_error = Some(err);
                }

                Ok(ReadResult::EndOfStream)
            }
            Received::Exhausted => {
                info!(slot = self.connector.slot().name(), "replication session ended");
                self.connector.stop().await?;

                Ok(ReadResult::EndOfStream)
            }
        }
    }

    async fn receive(&mut self, cancellation: &mut ShutdownRx) -> CdcResult<Received> {
        let Some(session) = self.connector.session_mut() else {
            bail!(ErrorKind::InvalidState, "Input has no replication session");
        };
        let (snapshot_rx, changes_rx) = session.receivers();

        loop {
            if self.snapshot_done && self.changes_done {
                return Ok(Received::Exhausted);
            }

            // Unbiased: when both channels are ready either may be picked.
            tokio::select! {
                event = snapshot_rx.recv(), if !self.snapshot_done => match event {
                    Some(event) => return Ok(Received::Event(event, EventSource::Snapshot)),
                    None => {
                        debug!("snapshot channel closed");
                        self.snapshot_done = true;
                    }
                },
                event = changes_rx.recv(), if !self.changes_done => match event {
                    Some(event) => return Ok(Received::Event(event, EventSource::Changes)),
                    None => {
                        debug!("change channel closed");
                        self.changes_done = true;
                    }
                },
                _ = cancelled(cancellation) => return Ok(Received::Cancelled),
            }
        }
    }

    fn envelope(
        &self,
        event: ChangeEvent,
        source: EventSource,
    ) -> CdcResult<(Message, Acknowledger<K>)> {
        let payload = self.encoder.encode(&event)?;
        let lsn = event.lsn();

        let target = match source {
            EventSource::Snapshot => AckTarget::Snapshot,
            EventSource::Changes => {
                let Some(committer) = self.committer.clone() else {
                    bail!(ErrorKind::InvalidState, "Input has no checkpoint committer");
                };
                AckTarget::Change { committer, lsn }
            }
        };

        Ok((Message::new(payload, source, lsn), Acknowledger { target }))
    }

    /// Stops the session, closes the checkpoint store and marks the input closed.
    ///
    /// The input is closed even when a step fails; every failure, including one that happened
    /// while a cancelled read stopped the session, is returned together. Closing again succeeds.
    pub async fn close(&mut self) -> CdcResult<()> {
        if self.connector.state() == ConnectorState::Closed {
            return Ok(());
        }

        let mut errors = Vec::new();
        if let Some(err) = self.stop_error.take() {
            errors.push(err);
        }
        if let Err(err) = self.connector.close().await {
            errors.push(err);
        }
        if let Err(err) = self.checkpoints.close().await {
            errors.push(err);
        }
        self.committer = None;

        if errors.is_empty() {
            info!(slot = self.connector.slot().name(), "input closed");
            return Ok(());
        }

        Err(errors.into())
    }
}

/// Resolves once `cancellation` fires. Never resolves if its sender is gone.
async fn cancelled(cancellation: &mut ShutdownRx) {
    if cancellation.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl<R, K> fmt::Debug for PgStreamInput<R, K>
where
    R: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStreamInput")
            .field("connector", &self.connector)
            .field("encoder", &self.encoder)
            .field("snapshot_done", &self.snapshot_done)
            .field("changes_done", &self.changes_done)
            .finish_non_exhaustive()
    }
}
