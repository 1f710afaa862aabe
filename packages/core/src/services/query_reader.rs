//! Query Data Reader
//!
//! Materializes a selection set against the record store, starting at one
//! record. The result is plain JSON shaped like the selections plus the set of
//! every record visited along the way, which callers use as the dependency set
//! for change subscriptions and garbage collection.
//!
//! # Missing Data
//!
//! - A root record that was never fetched is missing data.
//! - A deleted record reads as `null`.
//! - An absent field is missing data when the field is required (or when the
//!   read is strict), `null` otherwise.
//! - A connection window that the known edges cannot satisfy is missing data.
//!
//! Reading never writes; a failed read leaves the store untouched.

use crate::db::{RecordStore, StoreError};
use crate::models::{
    flatten_fields, DataId, Field, FieldKind, FieldValue, RangeWindow, RecordState, RootQuery,
    Selection, Variables, DATA_ID_KEY, RANGE_FIELD,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Predicate deciding which fields a read includes
pub type FieldFilter<'f> = &'f dyn Fn(&Field) -> bool;

#[derive(Clone, Copy, Default)]
pub struct ReadOptions<'f> {
    /// Skip fields the predicate rejects
    pub filter: Option<FieldFilter<'f>>,
    /// Treat every absent field as missing data, not only required ones
    pub strict: bool,
}

impl<'f> ReadOptions<'f> {
    pub fn strict() -> Self {
        Self {
            filter: None,
            strict: true,
        }
    }
}

/// Materialized data and the records it depends on
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub data: Value,
    pub data_ids: BTreeSet<DataId>,
}

/// Read `selections` starting at record `data_id`
pub fn read_query_data(
    store: &RecordStore,
    selections: &[Selection],
    data_id: &str,
    variables: &Variables,
    options: ReadOptions<'_>,
) -> Result<ReadResult, StoreError> {
    let mut reader = Reader::new(store, variables, options);
    let data = reader.read_record(data_id, selections)?;
    Ok(ReadResult {
        data,
        data_ids: reader.data_ids,
    })
}

/// Read a whole root query; data is keyed by the root field's response key
pub fn read_root_query(
    store: &RecordStore,
    query: &RootQuery,
    variables: &Variables,
    options: ReadOptions<'_>,
) -> Result<ReadResult, StoreError> {
    let field = &query.field;
    let (ids, plural) = match query.identifying_ids(variables)? {
        Some(ids) => {
            let plural = field.kind == FieldKind::Plural
                || field.identifying_call().map(|c| c.name == "ids").unwrap_or(false);
            (ids, plural)
        }
        None => {
            let storage_key = field.storage_key(variables)?;
            let ids = store
                .root_call_ids(&storage_key)
                .ok_or_else(|| StoreError::missing_record(storage_key.clone()))?
                .to_vec();
            (ids, field.kind == FieldKind::Plural)
        }
    };

    let mut reader = Reader::new(store, variables, options);
    let value = if plural {
        let items = ids
            .iter()
            .map(|id| reader.read_record(id, &field.selections))
            .collect::<Result<Vec<_>, _>>()?;
        Value::Array(items)
    } else {
        match ids.first() {
            Some(id) => reader.read_record(id, &field.selections)?,
            None => Value::Null,
        }
    };

    let mut data = Map::new();
    data.insert(field.response_key().to_string(), value);
    Ok(ReadResult {
        data: Value::Object(data),
        data_ids: reader.data_ids,
    })
}

struct Reader<'a, 'f> {
    store: &'a RecordStore,
    variables: &'a Variables,
    options: ReadOptions<'f>,
    data_ids: BTreeSet<DataId>,
}

impl<'a, 'f> Reader<'a, 'f> {
    fn new(store: &'a RecordStore, variables: &'a Variables, options: ReadOptions<'f>) -> Self {
        Self {
            store,
            variables,
            options,
            data_ids: BTreeSet::new(),
        }
    }

    fn includes(&self, field: &Field) -> bool {
        self.options.filter.map(|filter| filter(field)).unwrap_or(true)
    }

    fn absent(&self, data_id: &str, field: &Field) -> Result<Value, StoreError> {
        if field.required || self.options.strict {
            Err(StoreError::missing_field(data_id, field.response_key()))
        } else {
            Ok(Value::Null)
        }
    }

    fn read_record(&mut self, data_id: &str, selections: &[Selection]) -> Result<Value, StoreError> {
        self.data_ids.insert(data_id.to_string());
        match self.store.record_state(data_id) {
            RecordState::Unknown => return Err(StoreError::missing_record(data_id)),
            RecordState::Nonexistent => return Ok(Value::Null),
            RecordState::Existent => {}
        }

        let mut object = Map::new();
        object.insert(DATA_ID_KEY.to_string(), Value::String(data_id.to_string()));
        for field in flatten_fields(selections) {
            if !self.includes(field) {
                continue;
            }
            let value = self.read_field(data_id, field)?;
            object.insert(field.response_key().to_string(), value);
        }
        Ok(Value::Object(object))
    }

    fn read_field(&mut self, data_id: &str, field: &Field) -> Result<Value, StoreError> {
        let storage_key = field.storage_key(self.variables)?;
        let Some(stored) = self.store.get_field(data_id, &storage_key) else {
            return self.absent(data_id, field);
        };
        match (field.kind, stored) {
            (_, FieldValue::Null) => Ok(Value::Null),
            (FieldKind::Scalar, FieldValue::Scalar(value)) => Ok(value),
            (FieldKind::Linked, FieldValue::Reference(child_id)) => self.read_child(&child_id, field),
            (FieldKind::Plural, FieldValue::References(child_ids)) => {
                let items = child_ids
                    .iter()
                    .map(|child_id| self.read_child(child_id, field))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(items))
            }
            (FieldKind::Connection, FieldValue::Reference(connection_id)) => {
                self.read_connection(&connection_id, field)
            }
            (kind, stored) => Err(StoreError::invariant_violation(format!(
                "field '{}' of '{}' is selected as {:?} but holds {:?}",
                storage_key, data_id, kind, stored
            ))),
        }
    }

    fn read_child(&mut self, child_id: &str, field: &Field) -> Result<Value, StoreError> {
        if self.store.record_state(child_id) == RecordState::Unknown {
            // Still a dependency, so the read reruns once the record arrives
            self.data_ids.insert(child_id.to_string());
            if field.required || self.options.strict {
                return Err(StoreError::missing_record(child_id));
            }
            return Ok(Value::Null);
        }
        self.read_record(child_id, &field.selections)
    }

    fn read_connection(&mut self, connection_id: &str, field: &Field) -> Result<Value, StoreError> {
        self.data_ids.insert(connection_id.to_string());
        match self.store.record_state(connection_id) {
            RecordState::Unknown => return Err(StoreError::missing_record(connection_id)),
            RecordState::Nonexistent => return Ok(Value::Null),
            RecordState::Existent => {}
        }

        let mut window: Option<RangeWindow> = None;
        let mut object = Map::new();
        object.insert(
            DATA_ID_KEY.to_string(),
            Value::String(connection_id.to_string()),
        );
        for child in flatten_fields(&field.selections) {
            if !self.includes(child) {
                continue;
            }
            let value = match (child.name.as_str(), child.kind) {
                ("edges", FieldKind::Plural) => {
                    let window = self.window(&mut window, connection_id, field)?;
                    let mut edges = Vec::with_capacity(window.edges.len());
                    for edge in &window.edges {
                        self.data_ids.insert(edge.edge_id.clone());
                        let mut edge_object = Map::new();
                        edge_object.insert(
                            DATA_ID_KEY.to_string(),
                            Value::String(edge.edge_id.clone()),
                        );
                        for edge_field in flatten_fields(&child.selections) {
                            if !self.includes(edge_field) {
                                continue;
                            }
                            let edge_value = match edge_field.name.as_str() {
                                "cursor" => edge
                                    .cursor
                                    .clone()
                                    .map(Value::String)
                                    .unwrap_or(Value::Null),
                                _ => self.read_child(&edge.node_id, edge_field)?,
                            };
                            edge_object.insert(edge_field.response_key().to_string(), edge_value);
                        }
                        edges.push(Value::Object(edge_object));
                    }
                    Value::Array(edges)
                }
                ("pageInfo", FieldKind::Linked) => {
                    let window = self.window(&mut window, connection_id, field)?;
                    let mut info = Map::new();
                    for info_field in flatten_fields(&child.selections) {
                        if let Some(value) = window.page_info.field(&info_field.name) {
                            info.insert(info_field.response_key().to_string(), value);
                        }
                    }
                    Value::Object(info)
                }
                _ => self.read_field(connection_id, child)?,
            };
            object.insert(child.response_key().to_string(), value);
        }
        Ok(Value::Object(object))
    }

    /// Window of the connection's range, computed at most once per read
    fn window(
        &self,
        cached: &mut Option<RangeWindow>,
        connection_id: &str,
        field: &Field,
    ) -> Result<RangeWindow, StoreError> {
        if let Some(window) = cached {
            return Ok(window.clone());
        }
        let range = match self.store.get_field(connection_id, RANGE_FIELD) {
            Some(FieldValue::Range(range)) => range,
            _ => return Err(StoreError::missing_field(connection_id, "edges")),
        };
        let calls = field.range_calls(self.variables)?;
        let window = range
            .retrieve(&calls)
            .ok_or_else(|| StoreError::missing_field(connection_id, "edges"))?;
        *cached = Some(window.clone());
        Ok(window)
    }
}
