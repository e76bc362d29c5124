//! Decoding of `wal2json` format version 1 documents.
//!
//! The plugin emits one document per transaction:
//!
//! ```json
//! {"nextlsn": "0/16B3780", "change": [{"kind": "insert", "schema": "public", ...}]}
//! ```
//!
//! Every change of the transaction becomes a [`ChangeEvent`]. Only the last one carries the
//! transaction's position, so acknowledging it commits the whole transaction. That position is
//! `nextlsn`, the end of the commit record, which replication can resume from without replaying
//! the transaction.

use serde::Deserialize;
use serde_json::Value;
use tokio_postgres::types::PgLsn;
use tracing::warn;

use crate::cdc_error;
use crate::error::{CdcResult, ErrorKind};
use crate::types::ChangeEvent;

const SUPPORTED_KINDS: &[&str] = &["insert", "update", "delete"];

#[derive(Debug, Deserialize)]
struct Transaction {
    #[serde(default)]
    nextlsn: Option<String>,
    #[serde(default)]
    change: Vec<Value>,
}

/// Decodes a transaction document whose message header reported `received_lsn`.
///
/// The last change is stamped with the document's `nextlsn`. Documents without one, produced when
/// the plugin runs without `include-lsn`, fall back to `received_lsn`.
///
/// Changes of kinds other than insert, update and delete, such as `message` or `truncate`, are
/// skipped with a warning.
pub fn parse_transaction(data: &[u8], received_lsn: PgLsn) -> CdcResult<Vec<ChangeEvent>> {
    let transaction: Transaction = serde_json::from_slice(data)?;

    let commit_lsn = match transaction.nextlsn.as_deref() {
        Some(nextlsn) => nextlsn.parse::<PgLsn>().map_err(|_| {
            cdc_error!(
                ErrorKind::DeserializationError,
                "Malformed wal2json position",
                format!("nextlsn `{nextlsn}` is not a valid LSN")
            )
        })?,
        None => received_lsn,
    };

    let mut events = Vec::with_capacity(transaction.change.len());
    for change in transaction.change {
        let kind = change.get("kind").and_then(Value::as_str).unwrap_or_default();
        if !SUPPORTED_KINDS.contains(&kind) {
            warn!(kind, %commit_lsn, "skipping unsupported wal2json change");
            continue;
        }

        let event: ChangeEvent = serde_json::from_value(change).map_err(|err| {
            cdc_error!(
                ErrorKind::DeserializationError,
                "Malformed wal2json change",
                format!("change at {commit_lsn} could not be decoded: {err}"),
                source: err
            )
        })?;
        events.push(event);
    }

    if let Some(last) = events.last_mut() {
        last.lsn = Some(commit_lsn);
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::ChangeKind;

    fn lsn() -> PgLsn {
        "0/16B3748".parse().unwrap()
    }

    #[test]
    fn position_comes_from_commit_end_not_message_header() {
        let document = json!({
            "nextlsn": "0/16B3780",
            "change": [
                {"kind": "insert", "schema": "public", "table": "orders",
                 "columnnames": ["id"], "columntypes": ["integer"], "columnvalues": [1]},
                {"kind": "insert", "schema": "public", "table": "orders",
                 "columnnames": ["id"], "columntypes": ["integer"], "columnvalues": [2]}
            ]
        });

        let events = parse_transaction(document.to_string().as_bytes(), lsn()).unwrap();

        let commit_end: PgLsn = "0/16B3780".parse().unwrap();
        assert_eq!(events[0].lsn, None);
        assert_eq!(events[1].lsn, Some(commit_end));
        assert!(commit_end > lsn());
    }

    #[test]
    fn invalid_commit_position_is_rejected() {
        let err = parse_transaction(
            br#"{"nextlsn": "not-an-lsn", "change": []}"#,
            lsn(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }

    #[test]
    fn only_last_change_carries_position() {
        let document = json!({
            "change": [
                {
                    "kind": "insert",
                    "schema": "public",
                    "table": "orders",
                    "columnnames": ["id", "status"],
                    "columntypes": ["integer", "text"],
                    "columnvalues": [1, "new"]
                },
                {
                    "kind": "delete",
                    "schema": "public",
                    "table": "orders",
                    "oldkeys": {"keynames": ["id"], "keytypes": ["integer"], "keyvalues": [2]}
                }
            ]
        });

        let events = parse_transaction(document.to_string().as_bytes(), lsn()).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChangeKind::Insert);
        assert_eq!(events[0].lsn, None);
        assert_eq!(events[0].columnvalues, vec![json!(1), json!("new")]);
        assert_eq!(events[1].kind, ChangeKind::Delete);
        assert_eq!(events[1].lsn, Some(lsn()));
        assert!(events[1].columnnames.is_empty());
        assert_eq!(
            events[1].oldkeys.as_ref().map(|keys| keys.keyvalues.clone()),
            Some(vec![json!(2)])
        );
    }

    #[test]
    fn unsupported_kinds_are_skipped() {
        let document = json!({
            "change": [
                {"kind": "update", "schema": "public", "table": "orders",
                 "columnnames": ["id"], "columntypes": ["integer"], "columnvalues": [3]},
                {"kind": "message", "transactional": true, "prefix": "audit", "content": "x"}
            ]
        });

        let events = parse_transaction(document.to_string().as_bytes(), lsn()).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].lsn, Some(lsn()));
    }

    #[test]
    fn empty_transaction_yields_nothing() {
        let events = parse_transaction(br#"{"xid": 42, "change": []}"#, lsn()).unwrap();

        assert!(events.is_empty());
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let err = parse_transaction(b"{\"change\": [", lsn()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);

        let err = parse_transaction(
            br#"{"change": [{"kind": "insert", "schema": "public"}]}"#,
            lsn(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }
}
