use pg_stream_config::shared::StreamConfig;
use pg_stream_postgres::replication::slots::{SlotNameGenerator, server_slot_name};
use tracing::info;

use crate::error::CdcResult;

/// Identity and scope of one logical replication session.
///
/// Resolved once from configuration and never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationSlot {
    name: String,
    server_name: String,
    schema: String,
    tables: Vec<String>,
    stream_snapshot: bool,
    memory_safety_factor: f64,
}

impl ReplicationSlot {
    /// Builds the slot described by `config`.
    ///
    /// When no slot name is configured `generator` is called exactly once to supply one.
    pub fn resolve<G>(config: &StreamConfig, generator: &G) -> CdcResult<Self>
    where
        G: SlotNameGenerator + ?Sized,
    {
        let name = match &config.slot_name {
            Some(name) => name.clone(),
            None => {
                let name = generator.generate();
                info!(slot = %name, "no slot name configured, generated one");
                name
            }
        };
        let server_name = server_slot_name(&name)?;

        Ok(Self {
            name,
            server_name,
            schema: config.schema.clone(),
            tables: config.tables.clone(),
            stream_snapshot: config.stream_snapshot,
            memory_safety_factor: config.snapshot_memory_safety_factor,
        })
    }

    /// Name the checkpoint is stored under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the slot on the server, `rs_{name}`.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn stream_snapshot(&self) -> bool {
        self.stream_snapshot
    }

    pub fn memory_safety_factor(&self) -> f64 {
        self.memory_safety_factor
    }

    /// Tables prefixed with the schema, `schema.table`.
    pub fn qualified_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(|table| format!("{}.{}", self.schema, table))
            .collect()
    }
}
