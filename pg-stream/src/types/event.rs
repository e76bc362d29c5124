use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio_postgres::types::PgLsn;

/// Kind of row mutation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        };
        f.write_str(kind)
    }
}

/// Replica identity of the row before an update or a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldKeys {
    pub keynames: Vec<String>,
    pub keytypes: Vec<String>,
    pub keyvalues: Vec<Value>,
}

/// A single decoded row mutation.
///
/// Column vectors are parallel: `columnnames[i]` has type `columntypes[i]` and value
/// `columnvalues[i]`. Deletes carry no columns, only [`OldKeys`]. `lsn` is only ever set on events
/// decoded from the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub columnnames: Vec<String>,
    #[serde(default)]
    pub columntypes: Vec<String>,
    #[serde(default)]
    pub columnvalues: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldkeys: Option<OldKeys>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_lsn",
        deserialize_with = "deserialize_lsn"
    )]
    pub lsn: Option<PgLsn>,
}

impl ChangeEvent {
    /// Returns the position of the event, present only on events that close a transaction.
    pub fn lsn(&self) -> Option<PgLsn> {
        self.lsn
    }

    /// Fully qualified name of the table, `schema.table`.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

fn serialize_lsn<S>(lsn: &Option<PgLsn>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match lsn {
        Some(lsn) => serializer.collect_str(lsn),
        None => serializer.serialize_none(),
    }
}

fn deserialize_lsn<'de, D>(deserializer: D) -> Result<Option<PgLsn>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|lsn| {
            lsn.parse::<PgLsn>()
                .map_err(|_| serde::de::Error::custom(format!("invalid lsn `{lsn}`")))
        })
        .transpose()
}

/// Channel a message was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Pre-existing rows copied before live changes. Acknowledging them never writes a checkpoint.
    Snapshot,
    /// Live changes decoded from the replication slot.
    Changes,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn update_event(lsn: Option<PgLsn>) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Update,
            schema: "public".to_owned(),
            table: "orders".to_owned(),
            columnnames: vec!["id".to_owned(), "status".to_owned()],
            columntypes: vec!["integer".to_owned(), "text".to_owned()],
            columnvalues: vec![json!(7), json!("shipped")],
            oldkeys: Some(OldKeys {
                keynames: vec!["id".to_owned()],
                keytypes: vec!["integer".to_owned()],
                keyvalues: vec![json!(7)],
            }),
            lsn,
        }
    }

    #[test]
    fn lsn_is_rendered_as_text() {
        let lsn: PgLsn = "16/B374D848".parse().unwrap();
        let value = serde_json::to_value(update_event(Some(lsn))).unwrap();

        assert_eq!(value["lsn"], json!("16/B374D848"));
        assert_eq!(value["kind"], json!("update"));
        assert_eq!(value["oldkeys"]["keynames"], json!(["id"]));
    }

    #[test]
    fn absent_fields_are_omitted() {
        let mut event = update_event(None);
        event.oldkeys = None;

        let value = serde_json::to_value(event).unwrap();
        let object = value.as_object().unwrap();

        assert!(!object.contains_key("lsn"));
        assert!(!object.contains_key("oldkeys"));
    }

    #[test]
    fn invalid_lsn_is_rejected() {
        let result = serde_json::from_value::<ChangeEvent>(json!({
            "kind": "insert",
            "schema": "public",
            "table": "orders",
            "lsn": "not-an-lsn"
        }));

        assert!(result.is_err());
    }

    #[test]
    fn qualified_table_joins_schema_and_table() {
        assert_eq!(update_event(None).qualified_table(), "public.orders");
    }
}
