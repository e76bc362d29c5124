use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_postgres::types::PgLsn;

use crate::error::{CdcResult, ErrorKind};
use crate::replication::{ReplicationSession, ReplicationSlot, ReplicationSource, SessionSink};
use crate::types::ChangeEvent;
use crate::{bail, cdc_error};

const SNAPSHOT_CAPACITY: usize = 16;

/// What the scripted session does once its changes are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    RunUntilStopped,
    EndCleanly,
    FailWith(ErrorKind),
}

#[derive(Debug, Default)]
struct SourceStats {
    connects: AtomicUsize,
    stops: AtomicUsize,
    start_lsns: Mutex<Vec<Option<PgLsn>>>,
    confirmed: Mutex<Vec<PgLsn>>,
}

/// [`ReplicationSource`] replaying fixed snapshot rows and changes.
///
/// Changes are only produced once every snapshot row was received, which makes the order of
/// reads deterministic. Clones share their statistics.
#[derive(Debug, Clone)]
pub struct ScriptedReplicationSource {
    snapshot: Vec<ChangeEvent>,
    changes: Vec<ChangeEvent>,
    connect_failure: Option<ErrorKind>,
    panic_on_connect: bool,
    stop_failure: Option<ErrorKind>,
    end: SessionEnd,
    stats: Arc<SourceStats>,
}

impl Default for ScriptedReplicationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedReplicationSource {
    pub fn new() -> Self {
        Self {
            snapshot: Vec::new(),
            changes: Vec::new(),
            connect_failure: None,
            panic_on_connect: false,
            stop_failure: None,
            end: SessionEnd::RunUntilStopped,
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn with_snapshot(mut self, rows: Vec<ChangeEvent>) -> Self {
        self.snapshot = rows;
        self
    }

    pub fn with_changes(mut self, changes: Vec<ChangeEvent>) -> Self {
        self.changes = changes;
        self
    }

    /// Every connect fails with `kind`.
    pub fn failing_with(mut self, kind: ErrorKind) -> Self {
        self.connect_failure = Some(kind);
        self
    }

    /// Every connect panics.
    pub fn panicking(mut self) -> Self {
        self.panic_on_connect = true;
        self
    }

    /// The session fails with `kind` when it is stopped.
    pub fn failing_on_stop(mut self, kind: ErrorKind) -> Self {
        self.stop_failure = Some(kind);
        self
    }

    /// The session ends by itself after its changes were sent.
    pub fn ending_after_changes(mut self) -> Self {
        self.end = SessionEnd::EndCleanly;
        self
    }

    /// The session fails with `kind` after its changes were sent.
    pub fn failing_after_changes(mut self, kind: ErrorKind) -> Self {
        self.end = SessionEnd::FailWith(kind);
        self
    }

    /// Connect attempts, failed ones included.
    pub fn connects(&self) -> usize {
        self.stats.connects.load(Ordering::SeqCst)
    }

    /// Shutdown signals observed by sessions.
    pub fn stops(&self) -> usize {
        self.stats.stops.load(Ordering::SeqCst)
    }

    /// Start position requested by each successful connect.
    pub fn start_lsns(&self) -> Vec<Option<PgLsn>> {
        self.stats
            .start_lsns
            .lock()
            .map(|lsns| lsns.clone())
            .unwrap_or_default()
    }

    /// Positions reported as committed to the running session.
    pub fn confirmed_lsns(&self) -> Vec<PgLsn> {
        self.stats
            .confirmed
            .lock()
            .map(|lsns| lsns.clone())
            .unwrap_or_default()
    }

    fn stopped(&self) -> CdcResult<()> {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);

        match self.stop_failure {
            Some(kind) => Err(cdc_error!(kind, "Scripted stop failure")),
            None => Ok(()),
        }
    }

    async fn run(self, sink: SessionSink) -> CdcResult<()> {
        let SessionSink {
            snapshot_tx,
            changes_tx,
            mut shutdown_rx,
            mut feedback_rx,
        } = sink;

        for row in self.snapshot.iter().cloned() {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => return self.stopped(),
                sent = snapshot_tx.send(row) => if sent.is_err() {
                    break;
                },
            }
        }

        // Changes become visible only after the consumer received every snapshot row.
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => return self.stopped(),
            _ = snapshot_tx.reserve_many(SNAPSHOT_CAPACITY) => {},
        }
        drop(snapshot_tx);

        for change in self.changes.iter().cloned() {
            if changes_tx.send(change).is_err() {
                break;
            }
        }

        match self.end {
            SessionEnd::EndCleanly => return Ok(()),
            SessionEnd::FailWith(kind) => bail!(kind, "Scripted session failure"),
            SessionEnd::RunUntilStopped => {}
        }

        let mut feedback_open = true;
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => return self.stopped(),
                changed = feedback_rx.changed(), if feedback_open => {
                    if changed.is_err() {
                        feedback_open = false;
                        continue;
                    }

                    let confirmed = *feedback_rx.borrow_and_update();
                    if let Ok(mut lsns) = self.stats.confirmed.lock() {
                        lsns.push(confirmed);
                    }
                }
            }
        }
    }
}

impl ReplicationSource for ScriptedReplicationSource {
    async fn connect(
        &self,
        _slot: &ReplicationSlot,
        start_lsn: Option<PgLsn>,
    ) -> CdcResult<ReplicationSession> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);

        if self.panic_on_connect {
            panic!("scripted connect panic");
        }
        if let Some(kind) = self.connect_failure {
            bail!(kind, "Scripted connect failure");
        }

        if let Ok(mut lsns) = self.stats.start_lsns.lock() {
            lsns.push(start_lsn);
        }

        let script = self.clone();
        let committed = start_lsn.unwrap_or(PgLsn::from(0));

        Ok(ReplicationSession::spawn(
            SNAPSHOT_CAPACITY,
            committed,
            move |sink| script.run(sink),
        ))
    }
}
