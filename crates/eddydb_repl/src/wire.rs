//! Wire encoding of replication protocol messages.
//!
//! Profiles carried on the framing transport:
//! `getCheckpoint{client}`, `setCheckpoint{client,rev,body}`,
//! `subChanges{body}`, `proposeChanges`/`changes` (change lists),
//! `rev` (one revision), `getAttachment{digest}`.

use crate::error::ReplError;
use crate::store::ChangeEntry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Profile of a checkpoint read request.
pub const PROFILE_GET_CHECKPOINT: &str = "getCheckpoint";
/// Profile of a checkpoint write request.
pub const PROFILE_SET_CHECKPOINT: &str = "setCheckpoint";
/// Profile asking the peer to start enumerating its changes.
pub const PROFILE_SUB_CHANGES: &str = "subChanges";
/// Profile of a proposed change list (active pusher).
pub const PROFILE_PROPOSE_CHANGES: &str = "proposeChanges";
/// Profile of a change list (passive pusher).
pub const PROFILE_CHANGES: &str = "changes";
/// Profile carrying one revision body.
pub const PROFILE_REV: &str = "rev";
/// Profile requesting a blob by digest.
pub const PROFILE_GET_ATTACHMENT: &str = "getAttachment";

/// Body of a `subChanges` request: asks the peer to start enumerating
/// its changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubChanges {
    /// Sequence to resume from.
    #[serde(default)]
    pub since: u64,
    /// Suppress deletion tombstones.
    #[serde(default, rename = "skipDeleted")]
    pub skip_deleted: bool,
    /// Keep following the change feed after catching up.
    #[serde(default)]
    pub continuous: bool,
    /// Restrict enumeration to these document IDs.
    #[serde(default, rename = "docIDs", skip_serializing_if = "Option::is_none")]
    pub doc_ids: Option<Vec<String>>,
}

/// Response code for a change entry the receiver wants.
pub const CHANGE_WANTED: i64 = 0;
/// Response code for a change the receiver already has.
pub const CHANGE_HAVE: i64 = 304;
/// Response code for a change the receiver filtered out.
pub const CHANGE_FILTERED: i64 = 403;
/// Response code for a proposal rejected in no-conflicts mode.
pub const CHANGE_REJECTED: i64 = 409;

/// Encodes a change list as the body of a `changes`/`proposeChanges`
/// request: one `[sequence, docID, revID, deleted, bodySize, parent]`
/// row per entry.
#[must_use]
pub fn encode_changes(entries: &[ChangeEntry]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|e| {
                json!([
                    e.sequence,
                    e.doc_id,
                    e.rev_id,
                    u8::from(e.deleted),
                    e.body_size,
                    e.parent_rev_id,
                ])
            })
            .collect(),
    )
}

/// Decodes a change list body.
///
/// # Errors
///
/// Returns an HTTP 400 error on malformed rows.
pub fn decode_changes(body: &Value) -> Result<Vec<ChangeEntry>, ReplError> {
    let rows = body
        .as_array()
        .ok_or_else(|| ReplError::http(400, "changes body must be an array"))?;
    rows.iter()
        .map(|row| {
            let row = row
                .as_array()
                .filter(|r| r.len() >= 4)
                .ok_or_else(|| ReplError::http(400, "bad change row"))?;
            Ok(ChangeEntry {
                sequence: row[0]
                    .as_u64()
                    .ok_or_else(|| ReplError::http(400, "bad change sequence"))?,
                doc_id: row[1]
                    .as_str()
                    .ok_or_else(|| ReplError::http(400, "bad change docID"))?
                    .to_owned(),
                rev_id: row[2]
                    .as_str()
                    .ok_or_else(|| ReplError::http(400, "bad change revID"))?
                    .to_owned(),
                deleted: row[3].as_u64().unwrap_or(0) != 0,
                body_size: row.get(4).and_then(Value::as_u64).unwrap_or(0),
                parent_rev_id: row
                    .get(5)
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            })
        })
        .collect()
}

/// Encodes the response to a change list: one code per offered entry.
#[must_use]
pub fn encode_change_response(codes: &[i64]) -> Value {
    Value::Array(codes.iter().map(|&c| Value::from(c)).collect())
}

/// Decodes a change-list response.
///
/// # Errors
///
/// Returns an HTTP 400 error if the body is not an array of integers.
pub fn decode_change_response(body: &Value) -> Result<Vec<i64>, ReplError> {
    body.as_array()
        .ok_or_else(|| ReplError::http(400, "changes response must be an array"))?
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| ReplError::http(400, "bad change response code"))
        })
        .collect()
}

/// Encodes a revision history as the `history` property value.
#[must_use]
pub fn encode_history(history: &[String]) -> String {
    history.join(",")
}

/// Decodes the `history` property value.
#[must_use]
pub fn decode_history(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split(',').map(str::to_owned).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, doc: &str, rev: &str, parent: Option<&str>) -> ChangeEntry {
        ChangeEntry {
            sequence: seq,
            doc_id: doc.to_owned(),
            rev_id: rev.to_owned(),
            parent_rev_id: parent.map(str::to_owned),
            deleted: false,
            body_size: 17,
        }
    }

    #[test]
    fn changes_roundtrip() {
        let entries = vec![
            entry(1, "a", "1-aa", None),
            entry(2, "b", "2-bb", Some("1-bb")),
        ];
        let body = encode_changes(&entries);
        let decoded = decode_changes(&body).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn malformed_changes_are_rejected() {
        assert!(decode_changes(&serde_json::json!({"not": "array"})).is_err());
        assert!(decode_changes(&serde_json::json!([[1, "a"]])).is_err());
        assert!(decode_changes(&serde_json::json!([["x", "a", "1-aa", 0]])).is_err());
    }

    #[test]
    fn change_response_roundtrip() {
        let codes = vec![CHANGE_WANTED, CHANGE_HAVE, CHANGE_REJECTED, CHANGE_FILTERED];
        let body = encode_change_response(&codes);
        assert_eq!(decode_change_response(&body).unwrap(), codes);
    }

    #[test]
    fn sub_changes_serde_roundtrip() {
        let request = SubChanges {
            since: 42,
            skip_deleted: true,
            continuous: false,
            doc_ids: Some(vec!["a".to_owned()]),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["since"], 42);
        assert_eq!(json["skipDeleted"], true);
        assert_eq!(json["docIDs"][0], "a");

        let decoded: SubChanges = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.since, 42);
        assert!(decoded.skip_deleted);
        assert_eq!(decoded.doc_ids.as_deref().map(<[String]>::len), Some(1));

        // Missing fields fall back to defaults.
        let sparse: SubChanges = serde_json::from_str("{}").unwrap();
        assert_eq!(sparse.since, 0);
        assert!(!sparse.skip_deleted);
        assert!(sparse.doc_ids.is_none());
    }

    #[test]
    fn history_roundtrip() {
        assert_eq!(encode_history(&[]), "");
        assert_eq!(decode_history(""), Vec::<String>::new());
        let history = vec!["2-bb".to_owned(), "1-aa".to_owned()];
        assert_eq!(decode_history(&encode_history(&history)), history);
    }
}
