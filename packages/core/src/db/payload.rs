//! Payload normalization
//!
//! Server payloads arrive as nested JSON shaped like the query that fetched
//! them. Writing one walks the query and the payload side by side, flattening
//! every object into its own record and replacing nesting with references.
//!
//! # Identity
//!
//! - Objects with an `id` become (or update) the record with that id.
//! - Objects without one reuse the client id already stored in the parent's
//!   field, so refetching a `viewer` or a connection updates the same records.
//! - Anything else gets a fresh client id.
//!
//! Fields present in the query but absent from the payload are left alone;
//! fields present with `null` are written as null.

use crate::db::writer::RecordWriter;
use crate::db::StoreError;
use crate::models::{
    client_edge_id, flatten_fields, is_client_id, DataId, Field, FieldKind, FieldValue, QueryPath,
    RangeEdge, RootQuery, Selection, Variables,
};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Server id carried by a payload object
pub fn object_id(value: &Value) -> Option<DataId> {
    match value.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_object<'v>(value: &'v Value, context: &str) -> Result<&'v Map<String, Value>, StoreError> {
    value.as_object().ok_or_else(|| {
        StoreError::invalid_payload(format!("expected an object for '{}', got {}", context, value))
    })
}

/// Normalize the payload of one root query into the store
///
/// Returns the ids the root field resolved to.
pub fn write_query_payload(
    writer: &mut RecordWriter<'_>,
    query: &Arc<RootQuery>,
    variables: &Variables,
    payload: &Value,
) -> Result<Vec<DataId>, StoreError> {
    let field = &query.field;
    let response_key = field.response_key();
    let root = as_object(payload, &query.name)?;
    let Some(value) = root.get(response_key) else {
        return Err(StoreError::invalid_payload(format!(
            "payload of '{}' has no '{}' field",
            query.name, response_key
        )));
    };
    let root_path = QueryPath::from_query(query.clone(), variables.clone());

    match query.identifying_ids(variables)? {
        Some(ids) => {
            let items: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            let mut written = Vec::with_capacity(ids.len());
            for (index, data_id) in ids.iter().enumerate() {
                match items.get(index) {
                    Some(Value::Null) | None => writer.delete_record(data_id),
                    Some(item) => {
                        let path = root_path.child(field, data_id);
                        write_record_payload(writer, data_id, &field.selections, item, &path, variables)?;
                    }
                }
                written.push(data_id.clone());
            }
            Ok(written)
        }
        None => {
            let storage_key = field.storage_key(variables)?;
            let existing = writer.root_call_ids(&storage_key).unwrap_or_default();
            let items: Vec<&Value> = match value {
                Value::Null => Vec::new(),
                Value::Array(items) => items.iter().filter(|item| !item.is_null()).collect(),
                single => vec![single],
            };
            let mut ids = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let data_id = object_id(item)
                    .or_else(|| existing.get(index).filter(|id| is_client_id(id)).cloned())
                    .unwrap_or_else(|| writer.generate_client_id());
                let path = if is_client_id(&data_id) {
                    root_path.clone()
                } else {
                    QueryPath::for_node(data_id.clone())
                };
                write_record_payload(writer, &data_id, &field.selections, item, &path, variables)?;
                ids.push(data_id);
            }
            writer.put_root_call_ids(&storage_key, ids.clone());
            Ok(ids)
        }
    }
}

/// Normalize one payload object into the record `data_id`
pub fn write_record_payload(
    writer: &mut RecordWriter<'_>,
    data_id: &str,
    selections: &[Selection],
    value: &Value,
    path: &QueryPath,
    variables: &Variables,
) -> Result<(), StoreError> {
    let object = as_object(value, data_id)?;
    writer.put_record(data_id);
    writer.put_path(data_id, path.clone());

    for field in flatten_fields(selections) {
        let Some(field_value) = object.get(field.response_key()) else {
            continue;
        };
        let storage_key = field.storage_key(variables)?;
        match field.kind {
            FieldKind::Scalar => writer.put_scalar(data_id, &storage_key, field_value.clone()),
            FieldKind::Linked => {
                write_linked(writer, data_id, &storage_key, field, field_value, path, variables)?
            }
            FieldKind::Plural => {
                write_plural(writer, data_id, &storage_key, field, field_value, path, variables)?
            }
            FieldKind::Connection => {
                write_connection(writer, data_id, &storage_key, field, field_value, path, variables)?
            }
        }
    }
    Ok(())
}

fn write_linked(
    writer: &mut RecordWriter<'_>,
    data_id: &str,
    storage_key: &str,
    field: &Field,
    value: &Value,
    path: &QueryPath,
    variables: &Variables,
) -> Result<(), StoreError> {
    if value.is_null() {
        writer.put_record_reference(data_id, storage_key, None);
        return Ok(());
    }
    let child_id = object_id(value)
        .or_else(|| {
            writer
                .get_reference(data_id, storage_key)
                .filter(|id| is_client_id(id))
        })
        .unwrap_or_else(|| writer.generate_client_id());
    let child_path = path.child(field, &child_id);
    write_record_payload(writer, &child_id, &field.selections, value, &child_path, variables)?;
    writer.put_record_reference(data_id, storage_key, Some(&child_id));
    Ok(())
}

fn write_plural(
    writer: &mut RecordWriter<'_>,
    data_id: &str,
    storage_key: &str,
    field: &Field,
    value: &Value,
    path: &QueryPath,
    variables: &Variables,
) -> Result<(), StoreError> {
    let items = match value {
        Value::Null => {
            writer.put_field(data_id, storage_key, FieldValue::Null);
            return Ok(());
        }
        Value::Array(items) => items,
        other => {
            return Err(StoreError::invalid_payload(format!(
                "expected a list for '{}' on '{}', got {}",
                field.name, data_id, other
            )))
        }
    };
    let existing = writer.get_references(data_id, storage_key).unwrap_or_default();
    let mut ids = Vec::with_capacity(items.len());
    for (index, item) in items.iter().filter(|item| !item.is_null()).enumerate() {
        let child_id = object_id(item)
            .or_else(|| existing.get(index).filter(|id| is_client_id(id)).cloned())
            .unwrap_or_else(|| writer.generate_client_id());
        let child_path = path.child(field, &child_id);
        write_record_payload(writer, &child_id, &field.selections, item, &child_path, variables)?;
        ids.push(child_id);
    }
    writer.put_linked_record_ids(data_id, storage_key, ids);
    Ok(())
}

fn write_connection(
    writer: &mut RecordWriter<'_>,
    data_id: &str,
    storage_key: &str,
    field: &Field,
    value: &Value,
    path: &QueryPath,
    variables: &Variables,
) -> Result<(), StoreError> {
    if value.is_null() {
        writer.put_record_reference(data_id, storage_key, None);
        return Ok(());
    }
    let object = as_object(value, &field.name)?;
    let connection_id = writer
        .get_reference(data_id, storage_key)
        .unwrap_or_else(|| writer.generate_client_id());
    let connection_path = path.child(field, &connection_id);
    writer.put_record(&connection_id);
    writer.put_path(&connection_id, connection_path.clone());
    writer.put_record_reference(data_id, storage_key, Some(&connection_id));

    let mut edges = None;
    let mut page_info = None;
    for child in flatten_fields(&field.selections) {
        let Some(child_value) = object.get(child.response_key()) else {
            continue;
        };
        match (child.name.as_str(), child.kind) {
            ("edges", FieldKind::Plural) => {
                let Value::Array(items) = child_value else {
                    return Err(StoreError::invalid_payload(format!(
                        "expected a list of edges for '{}'",
                        field.name
                    )));
                };
                let mut written = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(edge) =
                        write_edge(writer, &connection_id, child, item, &connection_path, variables)?
                    {
                        written.push(edge);
                    }
                }
                edges = Some(written);
            }
            ("pageInfo", FieldKind::Linked) => page_info = Some(child_value),
            _ => {
                let child_key = child.storage_key(variables)?;
                writer.put_scalar(&connection_id, &child_key, child_value.clone());
            }
        }
    }

    if let Some(edges) = edges {
        let calls = field.range_calls(variables)?;
        let mut range = writer.get_range(&connection_id).unwrap_or_default();
        let flag = |name: &str, current: bool| {
            page_info
                .and_then(|info| info.get(name))
                .and_then(Value::as_bool)
                .unwrap_or(current)
        };
        let has_next_page = flag("hasNextPage", range.has_next_page);
        let has_previous_page = flag("hasPreviousPage", range.has_previous_page);
        range.apply_page(&calls, edges, has_next_page, has_previous_page);
        writer.put_range(&connection_id, range);
    }
    Ok(())
}

/// Normalize one edge object of a connection
///
/// `edges_field` is the `edges` selection (or any field selecting `cursor`
/// and `node`). Returns `None` for an edge without a node.
pub(crate) fn write_edge(
    writer: &mut RecordWriter<'_>,
    connection_id: &str,
    edges_field: &Field,
    value: &Value,
    connection_path: &QueryPath,
    variables: &Variables,
) -> Result<Option<RangeEdge>, StoreError> {
    let object = as_object(value, &edges_field.name)?;
    let node_field = edges_field.child("node");
    let node_value = node_field.and_then(|f| object.get(f.response_key()));
    let (Some(node_field), Some(node_value)) = (node_field, node_value) else {
        return Ok(None);
    };
    if node_value.is_null() {
        return Ok(None);
    }
    let node_id = object_id(node_value).unwrap_or_else(|| writer.generate_client_id());
    let edge_id = client_edge_id(connection_id, &node_id);
    let cursor = edges_field
        .child("cursor")
        .and_then(|f| object.get(f.response_key()))
        .and_then(Value::as_str)
        .map(str::to_string);

    let edge_path = connection_path.child(edges_field, &edge_id);
    writer.put_record(&edge_id);
    writer.put_path(&edge_id, edge_path.clone());
    if let Some(cursor) = &cursor {
        writer.put_scalar(&edge_id, "cursor", Value::String(cursor.clone()));
    }
    let node_path = edge_path.child(node_field, &node_id);
    write_record_payload(writer, &node_id, &node_field.selections, node_value, &node_path, variables)?;
    writer.put_record_reference(&edge_id, "node", Some(&node_id));

    Ok(Some(RangeEdge {
        edge_id,
        node_id,
        cursor,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record_store::{RecordStore, WriteLayer};
    use crate::models::{Call, ClientIdGenerator, RecordState, RANGE_FIELD};
    use serde_json::json;

    fn scalar(name: &str) -> Selection {
        Selection::Field(Field::scalar(name))
    }

    fn friends_query() -> Arc<RootQuery> {
        let edges = Field::plural(
            "edges",
            vec![
                scalar("cursor"),
                Selection::Field(Field::linked("node", vec![scalar("id"), scalar("name")])),
            ],
        );
        let page_info = Field::linked("pageInfo", vec![scalar("hasNextPage")]);
        let friends = Field::connection(
            "friends",
            vec![Selection::Field(edges), Selection::Field(page_info)],
        )
        .with_call(Call::literal("first", json!(2)));
        RootQuery::new(
            "FriendsQuery",
            Field::linked("node", vec![scalar("id"), Selection::Field(friends)])
                .with_call(Call::literal("id", json!("123"))),
        )
        .unwrap()
    }

    #[test]
    fn test_nested_objects_are_normalized() {
        let query = RootQuery::new(
            "ViewerQuery",
            Field::linked(
                "viewer",
                vec![Selection::Field(Field::linked(
                    "actor",
                    vec![scalar("id"), scalar("name")],
                ))],
            ),
        )
        .unwrap();
        let mut store = RecordStore::new();
        let ids = ClientIdGenerator::new();
        let mut writer = RecordWriter::new(&mut store, WriteLayer::Authoritative, &ids);
        let payload = json!({"viewer": {"actor": {"id": "4", "name": "Ada"}}});
        let roots = write_query_payload(&mut writer, &query, &Variables::new(), &payload).unwrap();
        assert_eq!(roots, vec!["client:1".to_string()]);

        // Writing again reuses the same client record for the root call
        let roots = write_query_payload(&mut writer, &query, &Variables::new(), &payload).unwrap();
        assert_eq!(roots, vec!["client:1".to_string()]);

        assert_eq!(writer.get_reference("client:1", "actor"), Some("4".to_string()));
        assert_eq!(
            writer.get_field("4", "name"),
            Some(FieldValue::Scalar(json!("Ada")))
        );
        assert!(writer.store().path("4").map(|p| p.is_rooted_at_node()).unwrap_or(false));
    }

    #[test]
    fn test_connection_payload_builds_range() {
        let query = friends_query();
        let mut store = RecordStore::new();
        let ids = ClientIdGenerator::new();
        let mut writer = RecordWriter::new(&mut store, WriteLayer::Authoritative, &ids);
        let payload = json!({"node": {"id": "123", "friends": {
            "edges": [
                {"cursor": "c1", "node": {"id": "1", "name": "A"}},
                {"cursor": "c2", "node": {"id": "2", "name": "B"}}
            ],
            "pageInfo": {"hasNextPage": true}
        }}});
        write_query_payload(&mut writer, &query, &Variables::new(), &payload).unwrap();

        let connection = writer.get_reference("123", "friends").unwrap();
        let range = writer.get_range(&connection).unwrap();
        assert_eq!(range.edges.len(), 2);
        assert!(range.has_next_page);
        assert_eq!(range.edges[0].edge_id, client_edge_id(&connection, "1"));
        assert_eq!(
            writer.get_reference(&range.edges[1].edge_id, "node"),
            Some("2".to_string())
        );
        assert!(writer.get_field(&connection, RANGE_FIELD).is_some());
    }

    #[test]
    fn test_null_identified_root_deletes_record() {
        let query = RootQuery::new(
            "NodeQuery",
            Field::linked("node", vec![scalar("id")]).with_call(Call::literal("id", json!("9"))),
        )
        .unwrap();
        let mut store = RecordStore::new();
        let ids = ClientIdGenerator::new();
        let mut writer = RecordWriter::new(&mut store, WriteLayer::Authoritative, &ids);
        write_query_payload(&mut writer, &query, &Variables::new(), &json!({"node": null})).unwrap();
        assert_eq!(writer.record_state("9"), RecordState::Nonexistent);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let query = friends_query();
        let mut store = RecordStore::new();
        let ids = ClientIdGenerator::new();
        let mut writer = RecordWriter::new(&mut store, WriteLayer::Authoritative, &ids);
        let result = write_query_payload(&mut writer, &query, &Variables::new(), &json!({"other": 1}));
        assert!(matches!(result, Err(StoreError::InvalidPayload(_))));
    }
}
