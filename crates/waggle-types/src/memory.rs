//! The collective-memory data model.
//!
//! A [`MemoryItem`] lives in exactly one category collection. Categories are a
//! closed enum here; the wire names are snake_case and stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

use crate::ids::MemoryId;

/// Memory category, one collection per value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
    Display, EnumString, AsRefStr, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemoryCategory {
    #[default]
    Global,
    Project,
    Agent,
    Infrastructure,
    Incidents,
    Monitoring,
    Runbooks,
    Security,
    Tickets,
    Directives,
    ConfigSnapshots,
    ConfigDiffs,
    ConfigAlerts,
    Broadcasts,
}

/// Visibility scope of a memory item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    Display, EnumString, AsRefStr, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemoryScope {
    #[default]
    Global,
    Project,
    Machine,
    Agent,
}

/// A scalar metadata value. Nested JSON is flattened to its string form at
/// ingest so metadata stays queryable as simple predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    /// Convert an arbitrary JSON value, serializing nested structures.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Bool(b) => MetaValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetaValue::Int(i)
                } else {
                    MetaValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => MetaValue::Str(s),
            other => MetaValue::Str(other.to_string()),
        }
    }
}

/// One item in the collective memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique, immutable, assigned at store time.
    pub id: MemoryId,
    /// UTF-8 content, never empty.
    pub content: String,
    pub category: MemoryCategory,
    pub scope: MemoryScope,
    /// Machine that issued the item.
    pub machine_id: String,
    /// Agent that issued the item.
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
    /// Optional short free-text context line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds, never before `created_at`.
    pub updated_at: i64,
    /// Embedding vector; absent when the embedder was unavailable at ingest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// One page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total matches before pagination.
    pub total: usize,
    pub has_more: bool,
    /// True when semantic ranking was requested but the page was served by
    /// the keyword fallback.
    #[serde(default)]
    pub degraded: bool,
}

impl<T> Page<T> {
    /// An empty page.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            has_more: false,
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_category_wire_names() {
        assert_eq!(MemoryCategory::ConfigSnapshots.to_string(), "config_snapshots");
        assert_eq!(
            MemoryCategory::from_str("config_diffs").unwrap(),
            MemoryCategory::ConfigDiffs
        );
        assert!(MemoryCategory::from_str("bogus").is_err());
    }

    #[test]
    fn test_scope_default_is_global() {
        assert_eq!(MemoryScope::default(), MemoryScope::Global);
    }

    #[test]
    fn test_meta_value_flattens_nested() {
        let nested = serde_json::json!({"ports": [22, 443]});
        match MetaValue::from_json(nested) {
            MetaValue::Str(s) => assert!(s.contains("22")),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_meta_value_scalars() {
        assert_eq!(MetaValue::from_json(serde_json::json!(7)), MetaValue::Int(7));
        assert_eq!(MetaValue::from_json(serde_json::json!(true)), MetaValue::Bool(true));
        assert_eq!(
            MetaValue::from_json(serde_json::json!(1.5)),
            MetaValue::Float(1.5)
        );
    }
}
