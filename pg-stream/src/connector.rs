//! Ownership of the single replication session of an input.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_postgres::types::PgLsn;
use tracing::{debug, error, info};

use crate::error::{CdcResult, ErrorKind};
use crate::replication::{ReplicationFeedback, ReplicationSession, ReplicationSlot, ReplicationSource};
use crate::{bail, cdc_error};

/// Lifecycle of a [`StreamConnector`].
///
/// `Idle -> Connecting -> Streaming -> Draining -> Closed`. A failed connect goes back to `Idle`
/// and `Closed` is reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Streaming,
    Draining,
    Closed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConnectorState::Idle => "idle",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Streaming => "streaming",
            ConnectorState::Draining => "draining",
            ConnectorState::Closed => "closed",
        };
        f.write_str(state)
    }
}

/// Owns at most one [`ReplicationSession`] opened through `R` on a fixed slot.
#[derive(Debug)]
pub struct StreamConnector<R> {
    source: R,
    slot: ReplicationSlot,
    state: ConnectorState,
    session: Option<ReplicationSession>,
}

impl<R> StreamConnector<R>
where
    R: ReplicationSource,
{
    pub fn new(source: R, slot: ReplicationSlot) -> Self {
        Self {
            source,
            slot,
            state: ConnectorState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn slot(&self) -> &ReplicationSlot {
        &self.slot
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    /// Fails unless a session may be opened from the current state.
    pub fn ensure_connectable(&self) -> CdcResult<()> {
        match self.state {
            ConnectorState::Idle | ConnectorState::Connecting => Ok(()),
            ConnectorState::Streaming => bail!(
                ErrorKind::ConnectorAlreadyStreaming,
                "Connector already owns a replication session",
                self.slot.name()
            ),
            ConnectorState::Draining => bail!(
                ErrorKind::InvalidState,
                "Connector cannot reconnect after its session was stopped",
                self.slot.name()
            ),
            ConnectorState::Closed => bail!(
                ErrorKind::ConnectorClosed,
                "Connector is closed",
                self.slot.name()
            ),
        }
    }

    /// Opens the replication session.
    ///
    /// Every failure, including a panic of the source, is returned as an error and leaves the
    /// connector `Idle`. Nothing is retried.
    pub async fn connect(&mut self, start_lsn: Option<PgLsn>) -> CdcResult<()> {
        self.ensure_connectable()?;

        self.state = ConnectorState::Connecting;
        info!(
            slot = self.slot.name(),
            start_lsn = ?start_lsn.map(|lsn| lsn.to_string()),
            "connecting replication session"
        );

        let connect = AssertUnwindSafe(self.source.connect(&self.slot, start_lsn));
        let result = match connect.catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(cdc_error!(
                ErrorKind::SourceConnectionFailed,
                "Replication source panicked while connecting",
                panic_message(panic.as_ref())
            )),
        };

        match result {
            Ok(session) => {
                self.session = Some(session);
                self.state = ConnectorState::Streaming;
                info!(slot = self.slot.name(), "replication session established");

                Ok(())
            }
            Err(err) => {
                self.state = ConnectorState::Idle;
                error!(slot = self.slot.name(), error = %err, "replication session could not be established");

                Err(err)
            }
        }
    }

    /// Session opened by [`StreamConnector::connect`], until the connector is closed.
    pub fn session_mut(&mut self) -> Option<&mut ReplicationSession> {
        self.session.as_mut()
    }

    pub fn feedback(&self) -> Option<ReplicationFeedback> {
        self.session.as_ref().map(ReplicationSession::feedback)
    }

    /// Stops the session and moves a streaming connector to `Draining`.
    ///
    /// A no-op when no session was ever opened or it was already stopped.
    pub async fn stop(&mut self) -> CdcResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if self.state == ConnectorState::Streaming {
            self.state = ConnectorState::Draining;
        }
        if session.is_stopped() {
            return Ok(());
        }

        debug!(slot = self.slot.name(), "stopping replication session");
        session.stop().await
    }

    /// Stops the session, releases it and marks the connector `Closed`, even when stopping
    /// failed.
    pub async fn close(&mut self) -> CdcResult<()> {
        if self.state == ConnectorState::Closed {
            return Ok(());
        }

        let result = self.stop().await;
        self.session = None;
        self.state = ConnectorState::Closed;
        info!(slot = self.slot.name(), "connector closed");

        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }

    "unknown panic payload".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::event::slot;
    use crate::test_utils::source::ScriptedReplicationSource;

    #[tokio::test]
    async fn connect_moves_to_streaming_and_rejects_second_connect() {
        let source = ScriptedReplicationSource::new();
        let mut connector = StreamConnector::new(source.clone(), slot("orders_slot"));

        connector.connect(None).await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Streaming);

        let err = connector.connect(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectorAlreadyStreaming);
        assert_eq!(source.connects(), 1);
    }

    #[tokio::test]
    async fn failed_connect_returns_to_idle() {
        let source =
            ScriptedReplicationSource::new().failing_with(ErrorKind::AuthenticationError);
        let mut connector = StreamConnector::new(source, slot("orders_slot"));

        let err = connector.connect(None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
        assert_eq!(connector.state(), ConnectorState::Idle);
    }

    #[tokio::test]
    async fn panicking_source_becomes_connect_error() {
        let source = ScriptedReplicationSource::new().panicking();
        let mut connector = StreamConnector::new(source, slot("orders_slot"));

        let err = connector.connect(None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
        assert!(err.detail().unwrap_or_default().contains("scripted connect panic"));
        assert_eq!(connector.state(), ConnectorState::Idle);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_noop_before_connect() {
        let source = ScriptedReplicationSource::new();
        let mut connector = StreamConnector::new(source.clone(), slot("orders_slot"));

        connector.stop().await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Idle);

        connector.connect(None).await.unwrap();
        connector.stop().await.unwrap();
        connector.stop().await.unwrap();

        assert_eq!(connector.state(), ConnectorState::Draining);
        assert_eq!(source.stops(), 1);

        let err = connector.connect(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn close_is_reachable_from_any_state() {
        let mut idle = StreamConnector::new(ScriptedReplicationSource::new(), slot("a"));
        idle.close().await.unwrap();
        idle.close().await.unwrap();
        assert_eq!(idle.state(), ConnectorState::Closed);

        let err = idle.connect(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectorClosed);

        let mut streaming = StreamConnector::new(ScriptedReplicationSource::new(), slot("b"));
        streaming.connect(None).await.unwrap();
        streaming.close().await.unwrap();
        assert_eq!(streaming.state(), ConnectorState::Closed);
        assert!(streaming.session_mut().is_none());
    }
}
