use std::fmt;
use std::sync::Arc;

use pg_escape::{quote_identifier, quote_literal};
use pg_stream_config::shared::{IntoConnectOptions, PgConnectionConfig, TlsMode};
use pg_stream_postgres::tls::encrypt_only_client_config;
use postgres_replication::ReplicationStream;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{
    Client, Config, Connection, NoTls, SimpleQueryMessage, SimpleQueryRow, Socket,
    config::ReplicationMode, types::PgLsn,
};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, error, info};

use crate::error::{CdcResult, ErrorKind};
use crate::{bail, cdc_error};

/// Output plugin the slot is created with.
pub const OUTPUT_PLUGIN: &str = "wal2json";

/// Drives a Postgres connection in the background until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!(error = %err, "postgres connection failed"),
            Ok(()) => info!("postgres connection terminated"),
        }
    }
    .instrument(span);

    // Dropping the client ends the connection, so the handle is not kept.
    tokio::spawn(task);
}

/// Opens a connection to the configured database, in logical replication mode when `replication`
/// is set.
pub async fn connect_client(config: &PgConnectionConfig, replication: bool) -> CdcResult<Client> {
    let mut options: Config = config.with_db();
    if replication {
        options.replication_mode(ReplicationMode::Logical);
    }

    let client = match config.tls {
        TlsMode::Require => {
            let tls = MakeRustlsConnect::new(encrypt_only_client_config()?);
            let (client, connection) = options.connect(tls).await?;
            spawn_postgres_connection::<MakeRustlsConnect>(connection);
            client
        }
        TlsMode::None => {
            let (client, connection) = options.connect(NoTls).await?;
            spawn_postgres_connection::<NoTls>(connection);
            client
        }
    };

    info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        tls = ?config.tls,
        replication,
        "connected to postgres"
    );

    Ok(client)
}

/// A slot that was created by this session.
#[derive(Debug, Clone)]
pub struct CreateSlotResult {
    /// Position from which the slot decodes changes.
    pub consistent_point: PgLsn,
    /// Snapshot exported at `consistent_point`, when one was requested.
    pub snapshot_name: Option<String>,
}

/// A slot that already existed.
#[derive(Debug, Clone)]
pub struct GetSlotResult {
    /// Position up to which the server considers changes consumed.
    pub confirmed_flush_lsn: PgLsn,
}

#[derive(Debug, Clone)]
pub enum GetOrCreateSlotResult {
    CreateSlot(CreateSlotResult),
    GetSlot(GetSlotResult),
}

impl GetOrCreateSlotResult {
    /// Position streaming starts from when the consumer has no checkpoint of its own.
    pub fn start_lsn(&self) -> PgLsn {
        match self {
            GetOrCreateSlotResult::CreateSlot(result) => result.consistent_point,
            GetOrCreateSlotResult::GetSlot(result) => result.confirmed_flush_lsn,
        }
    }

    /// Exported snapshot of a newly created slot.
    pub fn snapshot_name(&self) -> Option<&str> {
        match self {
            GetOrCreateSlotResult::CreateSlot(result) => result.snapshot_name.as_deref(),
            GetOrCreateSlotResult::GetSlot(_) => None,
        }
    }
}

/// Client over a connection in logical replication mode.
#[derive(Debug, Clone)]
pub struct PgReplicationClient {
    client: Arc<Client>,
}

impl PgReplicationClient {
    pub async fn connect(config: &PgConnectionConfig) -> CdcResult<Self> {
        let client = connect_client(config, true).await?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Returns the slot named `slot_name`, failing with
    /// [`ErrorKind::ReplicationSlotNotFound`] when it does not exist.
    pub async fn get_slot(&self, slot_name: &str) -> CdcResult<GetSlotResult> {
        let query = format!(
            r#"select confirmed_flush_lsn from pg_replication_slots where slot_name = {};"#,
            quote_literal(slot_name)
        );

        let results = self.client.simple_query(&query).await?;
        for result in results {
            if let SimpleQueryMessage::Row(row) = result {
                let confirmed_flush_lsn =
                    Self::get_row_value::<PgLsn>(&row, "confirmed_flush_lsn", "pg_replication_slots")?;

                return Ok(GetSlotResult {
                    confirmed_flush_lsn,
                });
            }
        }

        bail!(
            ErrorKind::ReplicationSlotNotFound,
            "Replication slot not found",
            format!("replication slot '{slot_name}' does not exist")
        );
    }

    /// Creates the slot, exporting a snapshot of its consistent point when `export_snapshot` is
    /// set.
    ///
    /// The exported snapshot stays importable only until the next command is issued on this
    /// connection.
    pub async fn create_slot(
        &self,
        slot_name: &str,
        export_snapshot: bool,
    ) -> CdcResult<CreateSlotResult> {
        // The replication command lexer only accepts uppercase keywords.
        let snapshot_option = if export_snapshot {
            "EXPORT_SNAPSHOT"
        } else {
            "NOEXPORT_SNAPSHOT"
        };
        let query = format!(
            r#"CREATE_REPLICATION_SLOT {} LOGICAL {} {}"#,
            quote_identifier(slot_name),
            OUTPUT_PLUGIN,
            snapshot_option
        );

        let results = match self.client.simple_query(&query).await {
            Ok(results) => results,
            Err(err) => {
                if let Some(code) = err.code()
                    && *code == SqlState::DUPLICATE_OBJECT
                {
                    bail!(
                        ErrorKind::ReplicationSlotAlreadyExists,
                        "Replication slot already exists",
                        format!("replication slot '{slot_name}' already exists"),
                        source: err
                    );
                }

                return Err(err.into());
            }
        };

        for result in results {
            if let SimpleQueryMessage::Row(row) = result {
                let consistent_point =
                    Self::get_row_value::<PgLsn>(&row, "consistent_point", "pg_replication_slots")?;
                let snapshot_name = match export_snapshot {
                    true => Some(Self::get_row_value::<String>(
                        &row,
                        "snapshot_name",
                        "pg_replication_slots",
                    )?),
                    false => None,
                };

                return Ok(CreateSlotResult {
                    consistent_point,
                    snapshot_name,
                });
            }
        }

        Err(cdc_error!(
            ErrorKind::ReplicationSlotNotCreated,
            "Replication slot creation returned no row",
            slot_name
        ))
    }

    /// Returns the slot named `slot_name`, creating it when it does not exist.
    pub async fn get_or_create_slot(
        &self,
        slot_name: &str,
        export_snapshot: bool,
    ) -> CdcResult<GetOrCreateSlotResult> {
        match self.get_slot(slot_name).await {
            Ok(slot) => {
                info!(slot = slot_name, lsn = %slot.confirmed_flush_lsn, "using existing replication slot");

                Ok(GetOrCreateSlotResult::GetSlot(slot))
            }
            Err(err) if err.kind() == ErrorKind::ReplicationSlotNotFound => {
                let slot = self.create_slot(slot_name, export_snapshot).await?;
                info!(slot = slot_name, lsn = %slot.consistent_point, "created replication slot");

                Ok(GetOrCreateSlotResult::CreateSlot(slot))
            }
            Err(err) => Err(err),
        }
    }

    /// Starts streaming `wal2json` documents of `tables` from `start_lsn`.
    ///
    /// `tables` must be schema qualified.
    pub async fn start_replication(
        &self,
        slot_name: &str,
        start_lsn: PgLsn,
        tables: &[String],
    ) -> CdcResult<ReplicationStream> {
        info!(slot = slot_name, lsn = %start_lsn, ?tables, "starting logical replication");

        let options = format!(
            r#"("pretty-print" '0', "include-xids" '0', "include-lsn" '1', "add-tables" {})"#,
            quote_literal(&tables.join(","))
        );
        let query = format!(
            r#"START_REPLICATION SLOT {} LOGICAL {} {}"#,
            quote_identifier(slot_name),
            start_lsn,
            options
        );

        let copy_stream = self.client.copy_both_simple::<bytes::Bytes>(&query).await?;

        Ok(ReplicationStream::new(copy_stream))
    }

    fn get_row_value<T: std::str::FromStr>(
        row: &SimpleQueryRow,
        column_name: &str,
        table_name: &str,
    ) -> CdcResult<T>
    where
        T::Err: fmt::Debug,
    {
        let value = row.try_get(column_name)?.ok_or_else(|| {
            cdc_error!(
                ErrorKind::SourceSchemaError,
                "Column not found",
                format!("column '{column_name}' of '{table_name}' is null or missing")
            )
        })?;

        value.parse().map_err(|err: T::Err| {
            cdc_error!(
                ErrorKind::ConversionError,
                "Column parsing failed",
                format!("value of column '{column_name}' of '{table_name}' is invalid: {err:?}")
            )
        })
    }
}
