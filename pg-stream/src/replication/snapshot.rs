//! Copy of the rows that exist when a slot is created.
//!
//! The copy runs on a regular connection inside a read-only repeatable read transaction that has
//! imported the snapshot exported by the slot, so it sees exactly the rows committed before the
//! slot's consistent point and nothing the change stream will deliver afterwards.

use pg_escape::quote_identifier;
use pg_stream_config::shared::PgConnectionConfig;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::cdc_error;
use crate::concurrency::memory::{
    DEFAULT_ROW_SIZE_BYTES, available_memory_bytes, snapshot_batch_size,
};
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{CdcResult, ErrorKind};
use crate::replication::ReplicationSlot;
use crate::replication::client::connect_client;
use crate::types::{ChangeEvent, ChangeKind};

const CURSOR_NAME: &str = "pg_stream_snapshot";

/// Rows sampled to estimate the average row size of a table.
const ROW_SIZE_SAMPLE: u32 = 1000;

/// Name and rendered type of a table column, in attribute order.
#[derive(Debug, Clone, PartialEq)]
struct SnapshotColumn {
    name: String,
    type_name: String,
}

/// A transaction pinned to an exported snapshot.
pub struct SnapshotReader {
    client: Client,
}

impl SnapshotReader {
    /// Opens a connection and imports `snapshot_name` into a new transaction.
    ///
    /// Must complete before the connection that exported the snapshot issues another command.
    pub async fn begin(config: &PgConnectionConfig, snapshot_name: &str) -> CdcResult<Self> {
        let client = connect_client(config, false).await?;

        client
            .simple_query("begin isolation level repeatable read read only;")
            .await?;
        client
            .simple_query(&format!(
                "set transaction snapshot {};",
                pg_escape::quote_literal(snapshot_name)
            ))
            .await?;
        debug!(snapshot = snapshot_name, "imported exported snapshot");

        Ok(Self { client })
    }

    /// Emits every row of the slot's tables as an insert without position, table by table.
    ///
    /// Returns the number of rows sent, wrapped in [`ShutdownResult::Shutdown`] when the copy was
    /// interrupted or the consumer went away.
    pub async fn copy_tables(
        self,
        slot: &ReplicationSlot,
        snapshot_tx: &mpsc::Sender<ChangeEvent>,
        shutdown_rx: &mut ShutdownRx,
    ) -> CdcResult<ShutdownResult<u64, u64>> {
        let mut total = 0;

        for table in slot.tables() {
            let copied = self
                .copy_table(slot, table, snapshot_tx, shutdown_rx)
                .await?;
            match copied {
                ShutdownResult::Ok(rows) => {
                    info!(schema = slot.schema(), table = %table, rows, "snapshot of table completed");
                    total += rows;
                }
                ShutdownResult::Shutdown(rows) => {
                    info!(schema = slot.schema(), table = %table, rows, "snapshot interrupted");
                    return Ok(ShutdownResult::Shutdown(total + rows));
                }
            }
        }

        self.client.simple_query("commit;").await?;

        Ok(ShutdownResult::Ok(total))
    }

    async fn copy_table(
        &self,
        slot: &ReplicationSlot,
        table: &str,
        snapshot_tx: &mpsc::Sender<ChangeEvent>,
        shutdown_rx: &mut ShutdownRx,
    ) -> CdcResult<ShutdownResult<u64, u64>> {
        let qualified = format!(
            "{}.{}",
            quote_identifier(slot.schema()),
            quote_identifier(table)
        );

        let columns = self.get_columns(&qualified).await?;
        if columns.is_empty() {
            return Err(cdc_error!(
                ErrorKind::SourceSchemaError,
                "Snapshot table has no columns",
                qualified
            ));
        }

        let avg_row_bytes = self.get_avg_row_size(&qualified).await?;
        let batch_size = snapshot_batch_size(
            available_memory_bytes(),
            slot.memory_safety_factor(),
            avg_row_bytes,
        );
        debug!(table = %qualified, avg_row_bytes, batch_size, "copying table");

        self.client
            .simple_query(&format!(
                "declare {CURSOR_NAME} no scroll cursor for select row_to_json(t)::text from {qualified} t;"
            ))
            .await?;

        let fetch = format!("fetch forward {batch_size} from {CURSOR_NAME};");
        let mut copied = 0;
        loop {
            let rows = self.client.query(fetch.as_str(), &[]).await?;
            if rows.is_empty() {
                break;
            }

            for row in rows {
                let document: String = row.try_get(0)?;
                let event = row_to_event(slot.schema(), table, &columns, &document)?;

                let sent = tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => false,
                    result = snapshot_tx.send(event) => result.is_ok(),
                };
                if !sent {
                    self.client
                        .simple_query(&format!("close {CURSOR_NAME};"))
                        .await?;
                    return Ok(ShutdownResult::Shutdown(copied));
                }

                copied += 1;
            }
        }

        self.client
            .simple_query(&format!("close {CURSOR_NAME};"))
            .await?;

        Ok(ShutdownResult::Ok(copied))
    }

    async fn get_columns(&self, qualified: &str) -> CdcResult<Vec<SnapshotColumn>> {
        let rows = self
            .client
            .query(
                "select a.attname, format_type(a.atttypid, a.atttypmod)
                from pg_attribute a
                where a.attrelid = $1::text::regclass and a.attnum > 0 and not a.attisdropped
                order by a.attnum",
                &[&qualified],
            )
            .await?;

        rows.iter()
            .map(|row| -> CdcResult<SnapshotColumn> {
                Ok(SnapshotColumn {
                    name: row.try_get(0)?,
                    type_name: row.try_get(1)?,
                })
            })
            .collect()
    }

    async fn get_avg_row_size(&self, qualified: &str) -> CdcResult<u64> {
        let row = self
            .client
            .query_one(
                &format!(
                    "select coalesce(avg(pg_column_size(t.*)), 0)::bigint from (select * from {qualified} limit {ROW_SIZE_SAMPLE}) t"
                ),
                &[],
            )
            .await?;
        let avg: i64 = row.try_get(0)?;

        Ok(match u64::try_from(avg) {
            Ok(0) | Err(_) => DEFAULT_ROW_SIZE_BYTES,
            Ok(avg) => avg,
        })
    }
}

/// Builds an insert event from the `row_to_json` rendering of a row.
fn row_to_event(
    schema: &str,
    table: &str,
    columns: &[SnapshotColumn],
    document: &str,
) -> CdcResult<ChangeEvent> {
    let mut values: Map<String, Value> = serde_json::from_str(document)?;

    let mut columnnames = Vec::with_capacity(columns.len());
    let mut columntypes = Vec::with_capacity(columns.len());
    let mut columnvalues = Vec::with_capacity(columns.len());
    for column in columns {
        columnnames.push(column.name.clone());
        columntypes.push(column.type_name.clone());
        columnvalues.push(values.remove(&column.name).unwrap_or(Value::Null));
    }

    Ok(ChangeEvent {
        kind: ChangeKind::Insert,
        schema: schema.to_owned(),
        table: table.to_owned(),
        columnnames,
        columntypes,
        columnvalues,
        oldkeys: None,
        lsn: None,
    })
}
