//! wal2json format-version 2 decoding.
//!
//! Each WAL entry is one JSON document with an `action` discriminator:
//! `I`/`U`/`D` carry row data, `B`/`C` bracket transactions, `T` and `M` are
//! truncates and logical messages. Only the row actions become channel
//! events.
use crate::{CdcError, CdcResult};
use serde::Deserialize;
use serde_json::Value;
use sluice_wire::{CdcChange, ChangeColumn, ChangeOp};

#[derive(Debug, Deserialize)]
struct RawEntry {
    action: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Vec<RawColumn>,
    #[serde(default)]
    identity: Vec<RawColumn>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    name: String,
    #[serde(rename = "type", default)]
    type_name: String,
    #[serde(default)]
    value: Value,
}

/// Decode one wal2json entry. Returns None for non-row actions.
pub fn decode_entry(lsn: u64, data: &str) -> CdcResult<Option<CdcChange>> {
    let raw: RawEntry =
        serde_json::from_str(data).map_err(|err| CdcError::BadWalEntry(err.to_string()))?;

    let operation = match raw.action.as_str() {
        "I" => ChangeOp::Insert,
        "U" => ChangeOp::Update,
        "D" => ChangeOp::Delete,
        // Begin/commit/truncate/message entries carry no row.
        "B" | "C" | "T" | "M" => return Ok(None),
        other => return Err(CdcError::BadWalEntry(format!("unknown action {other:?}"))),
    };

    let schema = raw
        .schema
        .ok_or_else(|| CdcError::BadWalEntry("row change without schema".into()))?;
    let table = raw
        .table
        .ok_or_else(|| CdcError::BadWalEntry("row change without table".into()))?;

    let mut record = serde_json::Map::new();
    let mut columns = Vec::with_capacity(raw.columns.len());
    for column in raw.columns {
        columns.push(ChangeColumn {
            name: column.name.clone(),
            type_name: column.type_name,
        });
        record.insert(column.name, column.value);
    }

    let mut old_record = serde_json::Map::new();
    for column in raw.identity {
        if operation == ChangeOp::Delete && !columns.iter().any(|c| c.name == column.name) {
            columns.push(ChangeColumn {
                name: column.name.clone(),
                type_name: column.type_name,
            });
        }
        old_record.insert(column.name, column.value);
    }

    Ok(Some(CdcChange {
        schema,
        table,
        operation,
        record,
        old_record,
        columns,
        commit_timestamp: raw.timestamp.unwrap_or_default(),
        lsn,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_insert() {
        let data = json!({
            "action": "I",
            "schema": "public",
            "table": "todos",
            "columns": [
                {"name": "id", "type": "integer", "value": 42},
                {"name": "title", "type": "text", "value": "write tests"}
            ],
            "timestamp": "2026-01-01 00:00:00.000000+00"
        })
        .to_string();
        let change = decode_entry(7, &data).expect("decode").expect("row change");
        assert_eq!(change.operation, ChangeOp::Insert);
        assert_eq!(change.schema, "public");
        assert_eq!(change.table, "todos");
        assert_eq!(change.record["id"], 42);
        assert_eq!(change.record["title"], "write tests");
        assert!(change.old_record.is_empty());
        assert_eq!(change.columns.len(), 2);
        assert_eq!(change.lsn, 7);
        assert!(!change.commit_timestamp.is_empty());
    }

    #[test]
    fn decodes_update_with_identity() {
        let data = json!({
            "action": "U",
            "schema": "public",
            "table": "todos",
            "columns": [{"name": "id", "type": "integer", "value": 1},
                        {"name": "done", "type": "boolean", "value": true}],
            "identity": [{"name": "id", "type": "integer", "value": 1}]
        })
        .to_string();
        let change = decode_entry(0, &data).expect("decode").expect("row change");
        assert_eq!(change.operation, ChangeOp::Update);
        assert_eq!(change.record["done"], true);
        assert_eq!(change.old_record["id"], 1);
    }

    #[test]
    fn delete_keeps_identity_columns_only() {
        let data = json!({
            "action": "D",
            "schema": "public",
            "table": "todos",
            "identity": [{"name": "id", "type": "integer", "value": 9}]
        })
        .to_string();
        let change = decode_entry(0, &data).expect("decode").expect("row change");
        assert_eq!(change.operation, ChangeOp::Delete);
        assert!(change.record.is_empty());
        assert_eq!(change.old_record["id"], 9);
        assert_eq!(change.columns.len(), 1);
    }

    #[test]
    fn transaction_markers_are_skipped() {
        for action in ["B", "C", "T", "M"] {
            let data = json!({"action": action}).to_string();
            assert!(decode_entry(0, &data).expect("decode").is_none());
        }
    }

    #[test]
    fn unknown_action_is_an_error() {
        let data = json!({"action": "X"}).to_string();
        assert!(matches!(
            decode_entry(0, &data),
            Err(CdcError::BadWalEntry(_))
        ));
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(matches!(
            decode_entry(0, "{truncated"),
            Err(CdcError::BadWalEntry(_))
        ));
    }

    #[test]
    fn row_change_without_table_is_an_error() {
        let data = json!({"action": "I", "schema": "public"}).to_string();
        assert!(decode_entry(0, &data).is_err());
    }
}
