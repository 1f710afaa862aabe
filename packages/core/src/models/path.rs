//! Query paths
//!
//! Records without a server id cannot be fetched directly. To refetch data for
//! one of them we walk back to the nearest ancestor that can be (a record with a
//! server id, or the query root) and replay the fields that lead down to it.

use crate::db::StoreError;
use crate::models::query::{Call, Field, RootQuery, Selection, Variables};
use crate::models::record::{is_client_id, DataId};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum PathRoot {
    Query {
        query: Arc<RootQuery>,
        variables: Variables,
    },
    Node {
        data_id: DataId,
    },
}

#[derive(Debug, Clone)]
struct PathSegment {
    /// Field traversed, with its selections stripped
    field: Field,
    data_id: DataId,
}

/// Route from a refetchable root down to one record
#[derive(Debug, Clone)]
pub struct QueryPath {
    root: PathRoot,
    segments: Vec<PathSegment>,
}

impl QueryPath {
    /// Path to the record a root query resolved to
    pub fn from_query(query: Arc<RootQuery>, variables: Variables) -> Self {
        Self {
            root: PathRoot::Query { query, variables },
            segments: Vec::new(),
        }
    }

    /// Path to a record that can be refetched by its own id
    pub fn for_node(data_id: impl Into<DataId>) -> Self {
        Self {
            root: PathRoot::Node {
                data_id: data_id.into(),
            },
            segments: Vec::new(),
        }
    }

    /// Path to `child_id`, reached from this path's record through `field`
    pub fn child(&self, field: &Field, child_id: &str) -> Self {
        if !is_client_id(child_id) {
            return Self::for_node(child_id);
        }
        let mut segments = self.segments.clone();
        segments.push(PathSegment {
            field: Field {
                selections: Vec::new(),
                ..field.clone()
            },
            data_id: child_id.to_string(),
        });
        Self {
            root: self.root.clone(),
            segments,
        }
    }

    /// Whether the path starts at a record with its own server id
    pub fn is_rooted_at_node(&self) -> bool {
        matches!(self.root, PathRoot::Node { .. })
    }

    /// Number of fields replayed below the root
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Record this path leads to
    pub fn data_id(&self) -> Option<&str> {
        match (self.segments.last(), &self.root) {
            (Some(segment), _) => Some(segment.data_id.as_str()),
            (None, PathRoot::Node { data_id }) => Some(data_id.as_str()),
            (None, PathRoot::Query { .. }) => None,
        }
    }

    /// Minimal query fetching `selections` on the record this path leads to
    pub fn refetch_query(
        &self,
        name: &str,
        selections: Vec<Selection>,
    ) -> Result<(Arc<RootQuery>, Variables), StoreError> {
        let mut inner = selections;
        for segment in self.segments.iter().rev() {
            let mut wrapper = segment.field.clone();
            wrapper.required = false;
            wrapper.selections = inner;
            inner = vec![Selection::Field(wrapper)];
        }

        match &self.root {
            PathRoot::Node { data_id } => {
                let mut node_selections = vec![Selection::Field(Field::scalar("id"))];
                node_selections.extend(inner);
                let field = Field::linked("node", node_selections)
                    .with_call(Call::literal("id", json!(data_id)));
                Ok((RootQuery::new(name, field)?, Variables::new()))
            }
            PathRoot::Query { query, variables } => {
                let mut field = query.field.clone();
                field.selections = inner;
                Ok((RootQuery::new(name, field)?, variables.clone()))
            }
        }
    }
}
