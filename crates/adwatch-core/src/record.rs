use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a completed scan does with previously known records that were
/// absent from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Absent records are simply left as-is (expired listings drop out
    /// upstream on their own).
    ReplaceOnly,
    /// Absent records are stamped with `deleted_at`; reappearing
    /// records have it cleared.
    SoftDelete,
}

/// Per-source reconciliation policy. Both crawlers share the same
/// merge contract but differ in merge key, list handling, and what a
/// completed scan implies about absent records.
#[derive(Debug, Clone, Copy)]
pub struct DomainProfile {
    /// Field holding the record identifier, unique within a scope.
    pub id_field: &'static str,
    /// List fields that accumulate across scans (set union) instead of
    /// being replaced by the incoming value.
    pub media_union_fields: &'static [&'static str],
    pub delete_policy: DeletePolicy,
}

pub(crate) const DELETED_AT: &str = "deleted_at";

/// One upstream listing, kept as the raw JSON object the source
/// returned. Upstream payloads are loosely typed and grow fields over
/// time; keeping the full object means a merge can never drop data the
/// model didn't know about.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingRecord(pub Map<String, Value>);

impl ListingRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON value, returning `None` for anything that is not
    /// an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Merge key under the given profile. Numeric identifiers are
    /// stringified so the key is stable across number/string
    /// representations of the same id.
    pub fn id(&self, profile: &DomainProfile) -> Option<String> {
        match self.0.get(profile.id_field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.str_field(DELETED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.0.get(DELETED_AT), Some(v) if !v.is_null())
    }

    pub fn set_deleted_at(&mut self, at: DateTime<Utc>) {
        self.0.insert(
            DELETED_AT.to_string(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
    }

    pub fn clear_deleted_at(&mut self) {
        self.0.insert(DELETED_AT.to_string(), Value::Null);
    }
}
