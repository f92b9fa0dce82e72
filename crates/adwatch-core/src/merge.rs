use serde_json::{Map, Value};

use crate::record::{DomainProfile, ListingRecord};

/// Field-level non-destructive merge of an incoming record into the
/// previously persisted one.
///
/// Null incoming fields never erase an existing value. Arrays replace
/// wholesale unless the field is listed in the profile's
/// `media_union_fields`, in which case the old and new entries are
/// unioned preserving first-seen order. Nested objects recurse with
/// the same rule; scalars overwrite.
pub fn merge_records(
    existing: &ListingRecord,
    incoming: &ListingRecord,
    profile: &DomainProfile,
) -> ListingRecord {
    ListingRecord(merge_maps(&existing.0, &incoming.0, profile.media_union_fields))
}

fn merge_maps(
    existing: &Map<String, Value>,
    incoming: &Map<String, Value>,
    union_fields: &[&str],
) -> Map<String, Value> {
    let mut out = existing.clone();
    for (key, value) in incoming {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                let merged = if union_fields.contains(&key.as_str()) {
                    union_lists(out.get(key), items)
                } else {
                    items.clone()
                };
                out.insert(key.clone(), Value::Array(merged));
            }
            Value::Object(nested) => {
                let base = match out.get(key) {
                    Some(Value::Object(map)) => map.clone(),
                    _ => Map::new(),
                };
                out.insert(
                    key.clone(),
                    Value::Object(merge_maps(&base, nested, union_fields)),
                );
            }
            scalar => {
                out.insert(key.clone(), scalar.clone());
            }
        }
    }
    out
}

fn union_lists(existing: Option<&Value>, incoming: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::new();
    if let Some(Value::Array(old)) = existing {
        for item in old {
            if !merged.contains(item) {
                merged.push(item.clone());
            }
        }
    }
    for item in incoming {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}
