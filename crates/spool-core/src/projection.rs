//! Payload projection: reduced views built from explicit field/index paths.
//!
//! A path addresses one subtree of the payload (`"shipping.address.city"`,
//! `"items.0.sku"`; a segment of ASCII digits indexes into an array). The
//! summary view for a record is its task metadata plus the union of the
//! requested subtrees; with no paths at all the payload is omitted
//! entirely.
//!
//! A path that misses (absent field, index past the end, traversal through
//! a scalar) contributes nothing. That is deliberate: summary queries run
//! over heterogeneous payloads and must not fail on the odd record that
//! lacks a field.

use serde_json::{Map, Value, json};

use crate::domain::TaskRecord;
use crate::error::SpoolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A parsed projection path, rooted at the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    /// Parse a dot-separated path. Digit-only segments index arrays.
    pub fn parse(spec: &str) -> Result<Self, SpoolError> {
        if spec.is_empty() {
            return Err(SpoolError::InvalidPath("empty path".to_string()));
        }
        let mut segments = Vec::new();
        for part in spec.split('.') {
            if part.is_empty() {
                return Err(SpoolError::InvalidPath(format!(
                    "empty segment in '{spec}'"
                )));
            }
            if part.bytes().all(|b| b.is_ascii_digit()) {
                let index: usize = part.parse().map_err(|_| {
                    SpoolError::InvalidPath(format!("index '{part}' out of range in '{spec}'"))
                })?;
                segments.push(PathSegment::Index(index));
            } else {
                segments.push(PathSegment::Field(part.to_string()));
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }
}

/// Build the summary view of a record: task metadata, plus the projected
/// payload when any path contributed. Lease bookkeeping and the version
/// token are engine-internal and never part of a summary.
pub fn summarize(record: &TaskRecord, paths: &[FieldPath]) -> Value {
    let mut out = Map::new();
    out.insert("id".to_string(), json!(record.id));
    out.insert("task_type".to_string(), json!(record.task_type));
    out.insert("status".to_string(), json!(record.status));
    if let Some(recurrence) = &record.recurrence {
        out.insert("recurrence".to_string(), json!(recurrence));
    }
    out.insert("next_run_at".to_string(), json!(record.next_run_at));
    out.insert("created_at".to_string(), json!(record.created_at));
    out.insert("updated_at".to_string(), json!(record.updated_at));

    if let Some(projected) = project(&record.payload, paths) {
        out.insert("payload".to_string(), projected);
    }

    Value::Object(out)
}

/// Union of the subtrees the paths select. `None` when no path contributed
/// (including the no-paths summary case).
pub fn project(payload: &Value, paths: &[FieldPath]) -> Option<Value> {
    let mut result: Option<Value> = None;
    for path in paths {
        let Some(contribution) = collect(payload, path.segments()) else {
            continue;
        };
        match result.as_mut() {
            Some(acc) => merge(acc, contribution),
            None => result = Some(contribution),
        }
    }
    result
}

/// Extract one subtree, rebuilding the nesting shape along the path.
/// Selected array elements keep their original positions; slots below them
/// are null-padded so overlapping paths merge positionally.
fn collect(source: &Value, segments: &[PathSegment]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(source.clone());
    };
    match head {
        PathSegment::Field(name) => {
            let child = source.as_object()?.get(name)?;
            let sub = collect(child, rest)?;
            let mut map = Map::new();
            map.insert(name.clone(), sub);
            Some(Value::Object(map))
        }
        PathSegment::Index(index) => {
            let child = source.as_array()?.get(*index)?;
            let sub = collect(child, rest)?;
            let mut slots = vec![Value::Null; index + 1];
            slots[*index] = sub;
            Some(Value::Array(slots))
        }
    }
}

/// Merge a contribution into the accumulated projection. Contributions all
/// derive from the same payload, so colliding scalars are identical; the
/// existing value wins on any residual shape mismatch.
fn merge(into: &mut Value, from: Value) {
    match (into, from) {
        (Value::Object(acc), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match acc.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        acc.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(acc), Value::Array(incoming)) => {
            if incoming.len() > acc.len() {
                acc.resize(incoming.len(), Value::Null);
            }
            for (i, value) in incoming.into_iter().enumerate() {
                if value.is_null() {
                    continue;
                }
                if acc[i].is_null() {
                    acc[i] = value;
                } else {
                    merge(&mut acc[i], value);
                }
            }
        }
        (_, _) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskType};
    use chrono::{DateTime, Utc};

    fn sample_record() -> TaskRecord {
        let now: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
        TaskRecord::new(
            TaskId::new("t1"),
            TaskType::new("orders"),
            json!({
                "customer": {"name": "Ada", "tier": "gold"},
                "items": [
                    {"sku": "a-1", "qty": 2},
                    {"sku": "b-2", "qty": 1},
                    {"sku": "c-3", "qty": 7}
                ],
                "total": 41.5
            }),
            None,
            now,
            now,
        )
    }

    fn paths(specs: &[&str]) -> Vec<FieldPath> {
        specs.iter().map(|s| FieldPath::parse(s).unwrap()).collect()
    }

    #[test]
    fn no_paths_yields_metadata_without_payload() {
        let summary = summarize(&sample_record(), &[]);
        let obj = summary.as_object().unwrap();
        assert_eq!(obj["id"], json!("t1"));
        assert_eq!(obj["task_type"], json!("orders"));
        assert_eq!(obj["status"], json!("Active"));
        assert!(!obj.contains_key("payload"));
        assert!(!obj.contains_key("lease_owner"));
        assert!(!obj.contains_key("version"));
    }

    #[test]
    fn nested_field_path_preserves_shape() {
        let summary = summarize(&sample_record(), &paths(&["customer.name"]));
        assert_eq!(
            summary["payload"],
            json!({"customer": {"name": "Ada"}})
        );
    }

    #[test]
    fn index_path_keeps_array_position() {
        let summary = summarize(&sample_record(), &paths(&["items.2.sku"]));
        assert_eq!(
            summary["payload"],
            json!({"items": [null, null, {"sku": "c-3"}]})
        );
    }

    #[test]
    fn overlapping_paths_merge_without_duplicates() {
        let summary = summarize(
            &sample_record(),
            &paths(&["customer", "customer.name", "items.0.sku", "items.0.qty"]),
        );
        assert_eq!(
            summary["payload"],
            json!({
                "customer": {"name": "Ada", "tier": "gold"},
                "items": [{"sku": "a-1", "qty": 2}]
            })
        );
    }

    #[test]
    fn misses_contribute_nothing() {
        // Absent field, index past the end, traversal through a scalar.
        let summary = summarize(
            &sample_record(),
            &paths(&["missing", "items.9.sku", "total.cents", "customer.name"]),
        );
        assert_eq!(
            summary["payload"],
            json!({"customer": {"name": "Ada"}})
        );
    }

    #[test]
    fn all_paths_missing_omits_payload() {
        let summary = summarize(&sample_record(), &paths(&["nope", "also.missing"]));
        assert!(!summary.as_object().unwrap().contains_key("payload"));
    }

    #[test]
    fn recurrence_appears_in_metadata_when_present() {
        let mut record = sample_record();
        record.recurrence = Some("*/5 * * * * *".to_string());
        let summary = summarize(&record, &[]);
        assert_eq!(summary["recurrence"], json!("*/5 * * * * *"));
    }

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse(".a").is_err());
    }

    #[test]
    fn digit_segments_parse_as_indices() {
        let path = FieldPath::parse("items.10.sku").unwrap();
        assert_eq!(
            path.segments()[1],
            PathSegment::Index(10)
        );
        // Non-digit segments stay fields even when they start with a digit.
        let path = FieldPath::parse("a.2b").unwrap();
        assert_eq!(path.segments()[1], PathSegment::Field("2b".to_string()));
    }
}
