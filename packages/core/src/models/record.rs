//! Record Data Structures
//!
//! A record is one normalized entity in the client-side graph. Fields hold
//! scalars, references to other records by identifier, or a connection range.
//! Records never embed other records directly; every edge is an identifier
//! lookup into the store, so cyclic graphs need no special handling.
//!
//! # Identifiers
//!
//! - **Server ids**: assigned by payloads (the `id` field of an object)
//! - **Client ids**: synthesized locally for objects without a server id,
//!   always prefixed with `client:` so they never collide with server ids

use crate::models::range::Range;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a record in the store
pub type DataId = String;

/// Locally generated identifier of a mutation transaction
pub type ClientMutationId = String;

/// Prefix reserved for locally generated identifiers
pub const CLIENT_ID_PREFIX: &str = "client:";

/// Field holding a connection record's range
pub const RANGE_FIELD: &str = "__range__";

/// Key under which every materialized object exposes its record id
pub const DATA_ID_KEY: &str = "__dataID__";

/// Returns true for identifiers synthesized on the client
pub fn is_client_id(id: &str) -> bool {
    id.starts_with(CLIENT_ID_PREFIX)
}

/// Deterministic id for the edge linking `node_id` into the connection `range_id`
pub fn client_edge_id(range_id: &str, node_id: &str) -> DataId {
    format!("{}{}:{}", CLIENT_ID_PREFIX, range_id, node_id)
}

/// Sequential generator for client ids, one per store instance
#[derive(Debug, Default)]
pub struct ClientIdGenerator {
    next: AtomicU64,
}

impl ClientIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self) -> DataId {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{}", CLIENT_ID_PREFIX, n)
    }
}

/// Value stored in a single record field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    /// Plain JSON value (string, number, bool, or an opaque list/object)
    Scalar(Value),
    /// Edge to a single record
    Reference(DataId),
    /// Ordered edges to several records
    References(Vec<DataId>),
    /// Window bookkeeping of a connection record
    Range(Range),
    /// Explicitly null; for reference fields this severs the edge
    Null,
}

impl FieldValue {
    /// Identifiers this value points at, in order
    pub fn referenced_ids(&self) -> Vec<&str> {
        match self {
            FieldValue::Reference(id) => vec![id.as_str()],
            FieldValue::References(ids) => ids.iter().map(String::as_str).collect(),
            FieldValue::Range(range) => range.edge_ids().collect(),
            FieldValue::Scalar(_) | FieldValue::Null => Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// Whether the store knows anything about a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Present with (possibly partial) data
    Existent,
    /// Known to be deleted
    Nonexistent,
    /// Never fetched
    Unknown,
}

/// A normalized record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: DataId,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(id: impl Into<DataId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, storage_key: &str) -> Option<&FieldValue> {
        self.fields.get(storage_key)
    }

    /// Every identifier referenced from this record's fields
    pub fn outgoing_references(&self) -> Vec<DataId> {
        self.fields
            .values()
            .flat_map(|value| value.referenced_ids())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_ids_are_prefixed_and_sequential() {
        let generator = ClientIdGenerator::new();
        assert_eq!(generator.generate(), "client:1");
        assert_eq!(generator.generate(), "client:2");
        assert!(is_client_id("client:7"));
        assert!(!is_client_id("123"));
    }

    #[test]
    fn test_edge_id_is_stable_per_connection_and_node() {
        assert_eq!(client_edge_id("client:3", "42"), "client:client:3:42");
        assert_eq!(client_edge_id("client:3", "42"), client_edge_id("client:3", "42"));
    }

    #[test]
    fn test_outgoing_references_skip_scalars() {
        let mut record = Record::new("1");
        record
            .fields
            .insert("name".to_string(), FieldValue::Scalar(json!("Ada")));
        record
            .fields
            .insert("author".to_string(), FieldValue::Reference("2".to_string()));
        record.fields.insert(
            "tags".to_string(),
            FieldValue::References(vec!["3".to_string(), "4".to_string()]),
        );
        record.fields.insert("editor".to_string(), FieldValue::Null);

        let mut refs = record.outgoing_references();
        refs.sort();
        assert_eq!(refs, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_field_value_serialization_is_tagged() {
        let value = FieldValue::Reference("client:1".to_string());
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, json!({"kind": "reference", "value": "client:1"}));
    }
}
