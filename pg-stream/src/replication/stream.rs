use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use pg_stream_postgres::time::POSTGRES_EPOCH;
use pin_project_lite::pin_project;
use postgres_replication::ReplicationStream;
use postgres_replication::protocol::ReplicationMessage;
use tokio_postgres::types::PgLsn;
use tracing::debug;

use crate::cdc_error;
use crate::error::{CdcResult, ErrorKind};

/// Minimum time between two unforced status updates reporting the same positions.
const STATUS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

pin_project! {
    /// Raw replication messages of a `wal2json` slot, plus standby status reporting.
    #[must_use = "streams do nothing unless polled"]
    pub struct WalEventsStream {
        #[pin]
        stream: ReplicationStream,
        last_update: Option<Instant>,
        last_flush_lsn: Option<PgLsn>,
    }
}

impl WalEventsStream {
    pub fn wrap(stream: ReplicationStream) -> Self {
        Self {
            stream,
            last_update: None,
            last_flush_lsn: None,
        }
    }

    /// Reports `write_lsn` as received and `flush_lsn` as durably consumed.
    ///
    /// Unless `force` is set, the update is skipped when `flush_lsn` did not move and the last
    /// update is more recent than [`STATUS_UPDATE_INTERVAL`]. The server may release WAL up to
    /// `flush_lsn` once it is reported.
    pub async fn send_status_update(
        self: Pin<&mut Self>,
        write_lsn: PgLsn,
        flush_lsn: PgLsn,
        force: bool,
    ) -> CdcResult<()> {
        let this = self.project();

        if !force
            && let (Some(last_update), Some(last_flush)) =
                (this.last_update.as_ref(), this.last_flush_lsn.as_ref())
            && is_redundant(*last_flush, flush_lsn, last_update.elapsed())
        {
            return Ok(());
        }

        // Microseconds since 2000-01-01 on the client clock.
        let ts = POSTGRES_EPOCH
            .elapsed()
            .map_err(|err| {
                cdc_error!(
                    ErrorKind::InvalidState,
                    "System clock is before the Postgres epoch",
                    source: err
                )
            })?
            .as_micros() as i64;

        // Apply and flush are the same position for a consumer without its own replay.
        this.stream
            .standby_status_update(write_lsn, flush_lsn, flush_lsn, ts, 0)
            .await?;

        debug!(%write_lsn, %flush_lsn, force, "sent standby status update");

        *this.last_update = Some(Instant::now());
        *this.last_flush_lsn = Some(flush_lsn);

        Ok(())
    }
}

fn is_redundant(last_flush: PgLsn, flush: PgLsn, since_last_update: Duration) -> bool {
    last_flush == flush && since_last_update < STATUS_UPDATE_INTERVAL
}

impl Stream for WalEventsStream {
    type Item = CdcResult<ReplicationMessage<Bytes>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.stream.poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
