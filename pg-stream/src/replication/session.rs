use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_postgres::types::PgLsn;
use tracing::{debug, warn};

use crate::cdc_error;
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{CdcResult, ErrorKind};
use crate::replication::ReplicationSlot;
use crate::types::ChangeEvent;

/// Capability of opening a replication session for a slot.
///
/// Implementations establish the session eagerly: every failure to do so is returned from
/// `connect` and never retried internally. Once connected, the session produces on its own
/// until stopped.
pub trait ReplicationSource {
    /// Opens a session on `slot`, streaming changes after `start_lsn`.
    ///
    /// Without `start_lsn` the source resumes from the position it tracks for the slot itself.
    fn connect(
        &self,
        slot: &ReplicationSlot,
        start_lsn: Option<PgLsn>,
    ) -> impl Future<Output = CdcResult<ReplicationSession>> + Send;
}

/// Producer side of a [`ReplicationSession`], owned by its background task.
#[derive(Debug)]
pub struct SessionSink {
    /// Pre-existing rows. Dropping it closes the snapshot channel.
    pub snapshot_tx: mpsc::Sender<ChangeEvent>,
    /// Live changes, in commit order.
    pub changes_tx: mpsc::UnboundedSender<ChangeEvent>,
    /// Fires when the session is stopped. The task must return promptly afterwards.
    pub shutdown_rx: ShutdownRx,
    /// Highest position durably committed by the consumer.
    pub feedback_rx: watch::Receiver<PgLsn>,
}

/// Reports durably committed positions back to the session.
#[derive(Debug, Clone)]
pub struct ReplicationFeedback {
    tx: Arc<watch::Sender<PgLsn>>,
}

impl ReplicationFeedback {
    /// Records `lsn` as committed. Positions older than the current one are ignored.
    pub fn confirm(&self, lsn: PgLsn) {
        self.tx.send_if_modified(|current| {
            if lsn > *current {
                *current = lsn;
                return true;
            }

            false
        });
    }

    pub fn confirmed(&self) -> PgLsn {
        *self.tx.borrow()
    }
}

/// A running replication session.
///
/// Holds the consumer side of the snapshot channel (bounded, finite) and of the change channel
/// (unbounded, open until the session stops) together with the task producing them.
#[derive(Debug)]
pub struct ReplicationSession {
    snapshot_rx: mpsc::Receiver<ChangeEvent>,
    changes_rx: mpsc::UnboundedReceiver<ChangeEvent>,
    feedback_tx: Arc<watch::Sender<PgLsn>>,
    shutdown_tx: ShutdownTx,
    handle: Option<JoinHandle<CdcResult<()>>>,
}

impl ReplicationSession {
    /// Spawns `producer` with a fresh [`SessionSink`].
    ///
    /// `committed_lsn` seeds the feedback channel, usually the position the session starts from.
    pub fn spawn<F, Fut>(snapshot_capacity: usize, committed_lsn: PgLsn, producer: F) -> Self
    where
        F: FnOnce(SessionSink) -> Fut,
        Fut: Future<Output = CdcResult<()>> + Send + 'static,
    {
        let (snapshot_tx, snapshot_rx) = mpsc::channel(snapshot_capacity.max(1));
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = watch::channel(committed_lsn);
        let (shutdown_tx, _) = create_shutdown_channel();

        let sink = SessionSink {
            snapshot_tx,
            changes_tx,
            shutdown_rx: shutdown_tx.subscribe(),
            feedback_rx,
        };
        let handle = tokio::spawn(producer(sink));

        Self {
            snapshot_rx,
            changes_rx,
            feedback_tx: Arc::new(feedback_tx),
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Both consumer channels, borrowed together so they can be awaited concurrently.
    pub fn receivers(
        &mut self,
    ) -> (
        &mut mpsc::Receiver<ChangeEvent>,
        &mut mpsc::UnboundedReceiver<ChangeEvent>,
    ) {
        (&mut self.snapshot_rx, &mut self.changes_rx)
    }

    pub fn feedback(&self) -> ReplicationFeedback {
        ReplicationFeedback {
            tx: self.feedback_tx.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_none()
    }

    /// Signals the producing task to stop and waits for it.
    ///
    /// Returns the task's own error, if it failed. Calling it again after it returned is a no-op.
    pub async fn stop(&mut self) -> CdcResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        // The task may already be gone together with its receiver.
        let _ = self.shutdown_tx.shutdown();
        self.snapshot_rx.close();
        self.changes_rx.close();

        let result = match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(cdc_error!(
                ErrorKind::SessionPanic,
                "Replication session panicked",
                source: err
            )),
            Err(err) => Err(cdc_error!(
                ErrorKind::SessionStopFailed,
                "Replication session could not be joined",
                source: err
            )),
        };

        match &result {
            Ok(()) => debug!("replication session stopped"),
            Err(err) => warn!(error = %err, "replication session stopped with an error"),
        }

        result
    }
}

impl Drop for ReplicationSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
