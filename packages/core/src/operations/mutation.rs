//! Mutation definitions and payload application
//!
//! A mutation describes itself through the [`Mutation`] trait: its name, input,
//! the fat query bounding what it may change, and configs telling the store
//! how to apply its payload (which records changed, which connection gained or
//! lost an edge). The same application code runs for optimistic responses
//! and for server responses.

use crate::db::payload::{object_id, write_edge, write_record_payload};
use crate::db::{RecordWriter, StoreError};
use crate::models::{
    flatten_fields, DataId, Field, FieldKind, FieldValue, QueryPath, RangeBehavior, Variables,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How a mutation payload maps onto the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationConfig {
    /// Payload fields update existing records; maps payload field names to
    /// the ids of the records they describe
    FieldsChange {
        field_ids: BTreeMap<String, Vec<DataId>>,
    },
    /// Payload field `edge_name` is a new edge of `connection_name` on `parent_id`
    RangeAdd {
        parent_id: DataId,
        connection_name: String,
        edge_name: String,
        range_behavior: RangeBehavior,
    },
    /// Payload field `deleted_id_field_name` names a deleted node
    NodeDelete {
        parent_id: DataId,
        connection_name: String,
        deleted_id_field_name: String,
    },
    /// Payload field `deleted_id_field_name` names a node removed from the connection
    RangeDelete {
        parent_id: DataId,
        connection_name: String,
        deleted_id_field_name: String,
    },
}

impl MutationConfig {
    /// `FieldsChange` for a single payload field
    pub fn fields_change(field_name: impl Into<String>, data_id: impl Into<DataId>) -> Self {
        let mut field_ids = BTreeMap::new();
        field_ids.insert(field_name.into(), vec![data_id.into()]);
        MutationConfig::FieldsChange { field_ids }
    }
}

/// A mutation the queue can send
pub trait Mutation: Send + Sync {
    /// Name of the root mutation field
    fn mutation_name(&self) -> &str;

    /// Every field the mutation could possibly change, as a field whose
    /// selections are the mutation payload
    fn fat_query(&self) -> Field;

    fn configs(&self) -> Vec<MutationConfig>;

    /// Input object sent with the mutation
    fn variables(&self) -> Value;

    /// Expected payload, written locally before the server answers
    fn optimistic_response(&self) -> Option<Value> {
        None
    }

    /// Fields of the optimistic response to write; inferred from the fat
    /// query when absent
    fn optimistic_query(&self) -> Option<Field> {
        None
    }

    /// Configs for the optimistic write; defaults to [`configs`](Self::configs)
    fn optimistic_configs(&self) -> Option<Vec<MutationConfig>> {
        None
    }

    /// Mutations sharing a key are sent one at a time, in commit order
    fn collision_key(&self) -> Option<String> {
        None
    }
}

/// Write a mutation payload shaped by `query` and apply `configs`
pub fn write_mutation_payload(
    writer: &mut RecordWriter<'_>,
    query: &Field,
    payload: &Value,
    configs: &[MutationConfig],
) -> Result<(), StoreError> {
    let Some(object) = payload.as_object() else {
        return Err(StoreError::invalid_payload(format!(
            "payload of mutation '{}' is not an object",
            query.name
        )));
    };
    let variables = Variables::new();
    let field_ids = configs
        .iter()
        .find_map(|config| match config {
            MutationConfig::FieldsChange { field_ids } => Some(field_ids),
            _ => None,
        });

    for field in flatten_fields(&query.selections) {
        let Some(value) = object.get(field.response_key()) else {
            continue;
        };
        let known_ids = field_ids
            .and_then(|ids| ids.get(field.response_key()))
            .cloned()
            .unwrap_or_default();
        match (field.kind, value) {
            (FieldKind::Linked, Value::Object(_)) => {
                let Some(data_id) = object_id(value).or_else(|| known_ids.first().cloned()) else {
                    tracing::warn!(
                        "Skipping payload field '{}' of '{}': no record id",
                        field.response_key(),
                        query.name
                    );
                    continue;
                };
                write_payload_record(writer, &data_id, field, value, &variables)?;
            }
            (FieldKind::Plural, Value::Array(items)) => {
                for (index, item) in items.iter().enumerate().filter(|(_, item)| item.is_object()) {
                    match object_id(item).or_else(|| known_ids.get(index).cloned()) {
                        Some(data_id) => write_payload_record(writer, &data_id, field, item, &variables)?,
                        None => tracing::warn!(
                            "Skipping element {} of payload field '{}': no record id",
                            index,
                            field.response_key()
                        ),
                    }
                }
            }
            // Scalars (clientMutationId), edges and deleted ids are handled by configs
            _ => {}
        }
    }

    for config in configs {
        apply_config(writer, query, object, config, &variables)?;
    }
    Ok(())
}

fn write_payload_record(
    writer: &mut RecordWriter<'_>,
    data_id: &str,
    field: &Field,
    value: &Value,
    variables: &Variables,
) -> Result<(), StoreError> {
    let path = writer
        .store()
        .path(data_id)
        .cloned()
        .unwrap_or_else(|| QueryPath::for_node(data_id));
    write_record_payload(writer, data_id, &field.selections, value, &path, variables)
}

/// Connection records hanging off `parent_id` under `connection_name`, for
/// every set of non-range arguments fetched so far
fn connection_ids(writer: &RecordWriter<'_>, parent_id: &str, connection_name: &str) -> Vec<DataId> {
    let Some(parent) = writer.get_record(parent_id) else {
        return Vec::new();
    };
    parent
        .fields
        .iter()
        .filter(|(key, _)| {
            key.as_str() == connection_name
                || key
                    .strip_prefix(connection_name)
                    .map(|rest| rest.starts_with('{'))
                    .unwrap_or(false)
        })
        .filter_map(|(_, value)| match value {
            FieldValue::Reference(id) => Some(id.clone()),
            _ => None,
        })
        .filter(|id| writer.get_range(id).is_some())
        .collect()
}

fn deleted_id(payload: &serde_json::Map<String, Value>, field_name: &str) -> Option<DataId> {
    match payload.get(field_name)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn apply_config(
    writer: &mut RecordWriter<'_>,
    query: &Field,
    payload: &serde_json::Map<String, Value>,
    config: &MutationConfig,
    variables: &Variables,
) -> Result<(), StoreError> {
    match config {
        MutationConfig::FieldsChange { .. } => Ok(()),
        MutationConfig::RangeAdd {
            parent_id,
            connection_name,
            edge_name,
            range_behavior,
        } => {
            let (Some(edge_field), Some(edge_value)) = (query.child(edge_name), payload.get(edge_name))
            else {
                return Ok(());
            };
            if !edge_value.is_object() {
                return Ok(());
            }
            let connections = connection_ids(writer, parent_id, connection_name);
            if connections.is_empty() {
                tracing::debug!(
                    "No fetched '{}' connection on '{}'; edge not added",
                    connection_name,
                    parent_id
                );
            }
            for connection_id in connections {
                let path = writer
                    .store()
                    .path(&connection_id)
                    .cloned()
                    .unwrap_or_else(|| QueryPath::for_node(parent_id.clone()));
                let Some(edge) =
                    write_edge(writer, &connection_id, edge_field, edge_value, &path, variables)?
                else {
                    continue;
                };
                if let Some(mut range) = writer.get_range(&connection_id) {
                    range.add_edge(edge, *range_behavior);
                    writer.put_range(&connection_id, range);
                }
            }
            Ok(())
        }
        MutationConfig::NodeDelete {
            parent_id,
            connection_name,
            deleted_id_field_name,
        }
        | MutationConfig::RangeDelete {
            parent_id,
            connection_name,
            deleted_id_field_name,
        } => {
            let Some(node_id) = deleted_id(payload, deleted_id_field_name) else {
                return Ok(());
            };
            for connection_id in connection_ids(writer, parent_id, connection_name) {
                if let Some(mut range) = writer.get_range(&connection_id) {
                    if range.remove_node(&node_id) {
                        writer.put_range(&connection_id, range);
                    }
                }
            }
            if matches!(config, MutationConfig::NodeDelete { .. }) {
                writer.delete_record(&node_id);
            }
            Ok(())
        }
    }
}
