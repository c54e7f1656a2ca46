//! JSON-lines encoding of history items.
//!
//! Each durable append is one JSON object terminated by `\n`. The record
//! carries every [`Item`] field except `id`, which is re-derived on replay.
//! Unknown keys and missing keys are both rejected.

use serde::{Deserialize, Serialize};
use watchpost_core::{CheckKind, Status};

use crate::error::{HistoryError, HistoryResult};
use crate::types::Item;

#[derive(Serialize)]
struct RecordRef<'a> {
    seq: u64,
    group: &'a str,
    name: &'a str,
    kind: CheckKind,
    output: &'a str,
    created_at: u64,
    duration_ms: u64,
    metric_value: Option<f64>,
    metric_unit: &'a str,
    status: Status,
    error: &'a str,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Record {
    seq: u64,
    group: String,
    name: String,
    kind: CheckKind,
    output: String,
    created_at: u64,
    duration_ms: u64,
    // `null` is allowed, a missing key is not.
    #[serde(deserialize_with = "Option::deserialize")]
    metric_value: Option<f64>,
    metric_unit: String,
    status: Status,
    error: String,
}

/// Encode an item as one newline-terminated log line.
///
/// Non-finite metric values are refused: JSON has no encoding for them and
/// they would come back as `null` on replay.
pub fn encode_line(item: &Item) -> HistoryResult<Vec<u8>> {
    if let Some(value) = item.metric_value.filter(|v| !v.is_finite()) {
        return Err(HistoryError::Serialize(format!(
            "metric value {value} is not a finite number"
        )));
    }
    let record = RecordRef {
        seq: item.seq,
        group: &item.group,
        name: &item.name,
        kind: item.kind,
        output: &item.output,
        created_at: item.created_at,
        duration_ms: item.duration_ms,
        metric_value: item.metric_value,
        metric_unit: &item.metric_unit,
        status: item.status,
        error: &item.error,
    };
    let mut line =
        serde_json::to_vec(&record).map_err(|e| HistoryError::Serialize(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one log line (without its trailing newline) into an item.
///
/// `line_no` is 1-based and only used for error reporting.
pub fn decode_line(line: &[u8], line_no: usize) -> HistoryResult<Item> {
    let record: Record = serde_json::from_slice(line).map_err(|e| HistoryError::Replay {
        line: line_no,
        reason: e.to_string(),
    })?;
    let mut item = Item {
        id: String::new(),
        seq: record.seq,
        group: record.group,
        name: record.name,
        kind: record.kind,
        output: record.output,
        created_at: record.created_at,
        duration_ms: record.duration_ms,
        metric_value: record.metric_value,
        metric_unit: record.metric_unit,
        status: record.status,
        error: record.error,
    };
    item.id = item.derive_id();
    Ok(item)
}
