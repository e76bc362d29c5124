use pg_stream_config::shared::{DEFAULT_SNAPSHOT_MEMORY_SAFETY_FACTOR, StreamConfig};
use pg_stream_postgres::replication::slots::FixedSlotNameGenerator;
use serde_json::json;
use tokio_postgres::types::PgLsn;

use crate::replication::ReplicationSlot;
use crate::types::{ChangeEvent, ChangeKind, OldKeys};

/// Parses an LSN in its `XXX/XXX` text form.
pub fn lsn(text: &str) -> PgLsn {
    text.parse()
        .unwrap_or_else(|_| panic!("`{text}` is not a valid lsn"))
}

/// A slot named `name` on `public.orders`, with snapshot enabled.
pub fn slot(name: &str) -> ReplicationSlot {
    let config = StreamConfig {
        schema: "public".to_owned(),
        tables: vec!["orders".to_owned()],
        stream_snapshot: true,
        snapshot_memory_safety_factor: DEFAULT_SNAPSHOT_MEMORY_SAFETY_FACTOR,
        slot_name: Some(name.to_owned()),
    };

    ReplicationSlot::resolve(&config, &FixedSlotNameGenerator(name.to_owned()))
        .unwrap_or_else(|err| panic!("invalid test slot `{name}`: {err}"))
}

/// An insert of row `id` without position, as produced by a snapshot.
pub fn insert_event(table: &str, id: i64) -> ChangeEvent {
    ChangeEvent {
        kind: ChangeKind::Insert,
        schema: "public".to_owned(),
        table: table.to_owned(),
        columnnames: vec!["id".to_owned(), "status".to_owned()],
        columntypes: vec!["bigint".to_owned(), "text".to_owned()],
        columnvalues: vec![json!(id), json!("new")],
        oldkeys: None,
        lsn: None,
    }
}

/// An update of row `id`, closing a transaction at `lsn` when given.
pub fn update_event(table: &str, id: i64, lsn: Option<PgLsn>) -> ChangeEvent {
    ChangeEvent {
        kind: ChangeKind::Update,
        schema: "public".to_owned(),
        table: table.to_owned(),
        columnnames: vec!["id".to_owned(), "status".to_owned()],
        columntypes: vec!["bigint".to_owned(), "text".to_owned()],
        columnvalues: vec![json!(id), json!("shipped")],
        oldkeys: Some(OldKeys {
            keynames: vec!["id".to_owned()],
            keytypes: vec!["bigint".to_owned()],
            keyvalues: vec![json!(id)],
        }),
        lsn,
    }
}
