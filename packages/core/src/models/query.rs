//! Abstract Query Tree
//!
//! The query-language compiler lives outside this crate; what reaches the store
//! is this tree of fields, fragments and root queries. Fragments are validated
//! when built so malformed definitions fail early instead of surfacing as odd
//! reads later.
//!
//! # Keys
//!
//! - **Storage key**: where a field lives inside a record. Arguments are part of
//!   the key (`profilePicture{size:64}`) except connection range arguments,
//!   which select a window of the same stored range.
//! - **Response key**: where a field appears in materialized data (alias or name).

use crate::db::StoreError;
use crate::models::range::RangeCalls;
use crate::models::record::DataId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Variable bindings for a query or fragment
pub type Variables = BTreeMap<String, Value>;

/// Arguments that page through a connection instead of identifying it
pub const RANGE_CALLS: [&str; 4] = ["first", "last", "after", "before"];

const PAGE_INFO_FIELDS: [&str; 4] = ["hasNextPage", "hasPreviousPage", "startCursor", "endCursor"];

static NEXT_FRAGMENT_ID: AtomicU64 = AtomicU64::new(0);

/// Argument value, either inline or bound through variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum CallValue {
    Literal(Value),
    Variable(String),
}

impl CallValue {
    pub fn resolve(&self, variables: &Variables) -> Result<Value, StoreError> {
        match self {
            CallValue::Literal(value) => Ok(value.clone()),
            CallValue::Variable(name) => variables.get(name).cloned().ok_or_else(|| {
                StoreError::invariant_violation(format!("variable '${}' is not bound", name))
            }),
        }
    }
}

/// A field argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    pub value: CallValue,
}

impl Call {
    pub fn literal(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value: CallValue::Literal(value),
        }
    }

    pub fn variable(name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: CallValue::Variable(variable.into()),
        }
    }

    fn is_range_call(&self) -> bool {
        RANGE_CALLS.contains(&self.name.as_str())
    }
}

/// Shape of the value a field holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Scalar,
    Linked,
    Plural,
    Connection,
}

/// Entry of a selection set
#[derive(Debug, Clone)]
pub enum Selection {
    Field(Field),
    Fragment(Arc<Fragment>),
}

/// A selected field
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub calls: Vec<Call>,
    pub kind: FieldKind,
    /// Non-optional: reading it while absent is missing data rather than null
    pub required: bool,
    pub selections: Vec<Selection>,
}

impl Field {
    fn new(name: impl Into<String>, kind: FieldKind, selections: Vec<Selection>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            calls: Vec::new(),
            kind,
            required: false,
            selections,
        }
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Scalar, Vec::new())
    }

    pub fn linked(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(name, FieldKind::Linked, selections)
    }

    pub fn plural(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(name, FieldKind::Plural, selections)
    }

    pub fn connection(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(name, FieldKind::Connection, selections)
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_call(mut self, call: Call) -> Self {
        self.calls.push(call);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Key of this field inside a record
    pub fn storage_key(&self, variables: &Variables) -> Result<String, StoreError> {
        let mut args: Vec<(&str, Value)> = Vec::new();
        for call in &self.calls {
            if self.kind == FieldKind::Connection && call.is_range_call() {
                continue;
            }
            args.push((call.name.as_str(), call.value.resolve(variables)?));
        }
        if args.is_empty() {
            return Ok(self.name.clone());
        }
        args.sort_by(|a, b| a.0.cmp(b.0));
        let rendered: Vec<String> = args
            .into_iter()
            .map(|(name, value)| format!("{}:{}", name, value))
            .collect();
        Ok(format!("{}{{{}}}", self.name, rendered.join(",")))
    }

    /// Pagination arguments of a connection field
    pub fn range_calls(&self, variables: &Variables) -> Result<RangeCalls, StoreError> {
        let mut calls = RangeCalls::default();
        for call in self.calls.iter().filter(|c| c.is_range_call()) {
            let value = call.value.resolve(variables)?;
            let count = || {
                value.as_u64().map(|n| n as usize).ok_or_else(|| {
                    StoreError::invariant_violation(format!(
                        "'{}' on '{}' must be a non-negative integer",
                        call.name, self.name
                    ))
                })
            };
            let cursor = || value.as_str().map(str::to_string);
            match call.name.as_str() {
                "first" => calls.first = Some(count()?),
                "last" => calls.last = Some(count()?),
                "after" => calls.after = cursor(),
                "before" => calls.before = cursor(),
                _ => {}
            }
        }
        Ok(calls)
    }

    /// `id`/`ids` argument naming the records a root field addresses
    pub fn identifying_call(&self) -> Option<&Call> {
        self.calls
            .iter()
            .find(|call| call.name == "id" || call.name == "ids")
    }

    /// Child field with the given response key, looking through fragments
    pub fn child(&self, response_key: &str) -> Option<&Field> {
        flatten_fields(&self.selections)
            .into_iter()
            .find(|field| field.response_key() == response_key)
    }
}

/// Fields of a selection set with nested fragments spread inline
pub fn flatten_fields(selections: &[Selection]) -> Vec<&Field> {
    let mut fields = Vec::new();
    for selection in selections {
        match selection {
            Selection::Field(field) => fields.push(field),
            Selection::Fragment(fragment) => fields.extend(flatten_fields(&fragment.selections)),
        }
    }
    fields
}

/// Identity of a built fragment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId(String);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reusable selection set applied to one record (or a list of records)
#[derive(Debug)]
pub struct Fragment {
    id: FragmentId,
    pub name: String,
    pub type_name: String,
    pub plural: bool,
    pub selections: Vec<Selection>,
}

impl Fragment {
    /// Build and validate a fragment for a single record
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        selections: Vec<Selection>,
    ) -> Result<Arc<Self>, StoreError> {
        Self::build(name.into(), type_name.into(), false, selections)
    }

    /// Build and validate a fragment applied to a list of records
    pub fn new_plural(
        name: impl Into<String>,
        type_name: impl Into<String>,
        selections: Vec<Selection>,
    ) -> Result<Arc<Self>, StoreError> {
        Self::build(name.into(), type_name.into(), true, selections)
    }

    fn build(
        name: String,
        type_name: String,
        plural: bool,
        selections: Vec<Selection>,
    ) -> Result<Arc<Self>, StoreError> {
        validate_selections(&selections, &name)?;
        let seq = NEXT_FRAGMENT_ID.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Self {
            id: FragmentId(format!("{}:{}", name, seq)),
            name,
            type_name,
            plural,
            selections,
        }))
    }

    pub fn id(&self) -> &FragmentId {
        &self.id
    }
}

/// A top-level query: one root field plus its selections
#[derive(Debug, Clone)]
pub struct RootQuery {
    pub name: String,
    pub field: Field,
}

impl RootQuery {
    pub fn new(name: impl Into<String>, field: Field) -> Result<Arc<Self>, StoreError> {
        let name = name.into();
        validate_field(&field, &name)?;
        Ok(Arc::new(Self { name, field }))
    }

    /// Records addressed directly by an `id`/`ids` argument
    pub fn identifying_ids(&self, variables: &Variables) -> Result<Option<Vec<DataId>>, StoreError> {
        let Some(call) = self.field.identifying_call() else {
            return Ok(None);
        };
        let value = call.value.resolve(variables)?;
        let ids = match value {
            Value::String(id) => vec![id],
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(id) => Ok(id),
                    other => Err(StoreError::invariant_violation(format!(
                        "identifying argument of '{}' must be a string, got {}",
                        self.name, other
                    ))),
                })
                .collect::<Result<_, _>>()?,
            Value::Number(n) => vec![n.to_string()],
            other => {
                return Err(StoreError::invariant_violation(format!(
                    "identifying argument of '{}' must be a string, got {}",
                    self.name, other
                )))
            }
        };
        Ok(Some(ids))
    }
}

fn validate_selections(selections: &[Selection], context: &str) -> Result<(), StoreError> {
    let mut seen: HashMap<&str, &Field> = HashMap::new();
    for field in flatten_fields(selections) {
        if let Some(previous) = seen.insert(field.response_key(), field) {
            let same = previous.name == field.name
                && previous.kind == field.kind
                && previous.calls == field.calls;
            if !same {
                return Err(StoreError::invariant_violation(format!(
                    "'{}' selects conflicting fields under response key '{}'",
                    context,
                    field.response_key()
                )));
            }
        }
    }
    for selection in selections {
        if let Selection::Field(field) = selection {
            validate_field(field, context)?;
        }
    }
    Ok(())
}

fn validate_field(field: &Field, context: &str) -> Result<(), StoreError> {
    let violation = |reason: &str| {
        Err(StoreError::invariant_violation(format!(
            "field '{}' in '{}' {}",
            field.name, context, reason
        )))
    };
    match field.kind {
        FieldKind::Scalar if !field.selections.is_empty() => {
            return violation("is a scalar but has selections")
        }
        FieldKind::Scalar => return Ok(()),
        _ if field.selections.is_empty() => return violation("must select at least one field"),
        _ => {}
    }

    if field.kind == FieldKind::Connection {
        let has = |name: &str| field.calls.iter().any(|c| c.name == name);
        if has("first") && has("last") {
            return violation("cannot page with both 'first' and 'last'");
        }
        for child in &field.selections {
            let Selection::Field(child) = child else {
                return violation("cannot spread fragments directly on a connection");
            };
            match (child.name.as_str(), child.kind) {
                ("edges", FieldKind::Plural) => {
                    for edge_field in flatten_fields(&child.selections) {
                        match (edge_field.name.as_str(), edge_field.kind) {
                            ("cursor", FieldKind::Scalar) | ("node", FieldKind::Linked) => {}
                            _ => return violation("edges may only select 'cursor' and 'node'"),
                        }
                    }
                }
                ("pageInfo", FieldKind::Linked) => {
                    for info in flatten_fields(&child.selections) {
                        if !PAGE_INFO_FIELDS.contains(&info.name.as_str()) {
                            return violation("selects an unknown pageInfo field");
                        }
                    }
                }
                (_, FieldKind::Scalar) => {}
                _ => return violation("may only select edges, pageInfo and scalars"),
            }
        }
    }

    validate_selections(&field.selections, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_storage_key_sorts_arguments_and_skips_range_calls() {
        let field = Field::connection(
            "friends",
            vec![Selection::Field(Field::scalar("count"))],
        )
        .with_call(Call::literal("orderby", json!("name")))
        .with_call(Call::literal("first", json!(10)))
        .with_call(Call::literal("isViewerFriend", json!(true)));

        let key = field.storage_key(&Variables::new()).unwrap();
        assert_eq!(key, r#"friends{isViewerFriend:true,orderby:"name"}"#);
    }

    #[test]
    fn test_storage_key_resolves_variables() {
        let field = Field::scalar("profilePicture").with_call(Call::variable("size", "size"));
        let mut vars = Variables::new();
        vars.insert("size".to_string(), json!(64));
        assert_eq!(field.storage_key(&vars).unwrap(), "profilePicture{size:64}");

        let unbound = field.storage_key(&Variables::new());
        assert!(matches!(unbound, Err(StoreError::InvariantViolation(_))));
    }

    #[test]
    fn test_fragment_rejects_scalar_with_selections() {
        let mut bad = Field::scalar("name");
        bad.selections.push(Selection::Field(Field::scalar("first")));
        let result = Fragment::new("UserName", "User", vec![Selection::Field(bad)]);
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
    }

    #[test]
    fn test_fragment_rejects_conflicting_aliases() {
        let result = Fragment::new(
            "Conflict",
            "User",
            vec![
                Selection::Field(Field::scalar("name").with_alias("label")),
                Selection::Field(Field::scalar("email").with_alias("label")),
            ],
        );
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
    }

    #[test]
    fn test_connection_shape_is_validated() {
        let bad = Field::connection(
            "friends",
            vec![Selection::Field(Field::linked(
                "owner",
                vec![Selection::Field(Field::scalar("id"))],
            ))],
        );
        assert!(Fragment::new("Friends", "User", vec![Selection::Field(bad)]).is_err());

        let both = Field::connection(
            "friends",
            vec![Selection::Field(Field::scalar("count"))],
        )
        .with_call(Call::literal("first", json!(1)))
        .with_call(Call::literal("last", json!(1)));
        assert!(Fragment::new("Friends", "User", vec![Selection::Field(both)]).is_err());
    }

    #[test]
    fn test_fragments_get_distinct_ids() {
        let a = Fragment::new("Same", "User", vec![Selection::Field(Field::scalar("id"))]).unwrap();
        let b = Fragment::new("Same", "User", vec![Selection::Field(Field::scalar("id"))]).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_identifying_ids() {
        let query = RootQuery::new(
            "NodeQuery",
            Field::linked("node", vec![Selection::Field(Field::scalar("id"))])
                .with_call(Call::literal("id", json!("123"))),
        )
        .unwrap();
        assert_eq!(
            query.identifying_ids(&Variables::new()).unwrap(),
            Some(vec!["123".to_string()])
        );

        let viewer = RootQuery::new(
            "ViewerQuery",
            Field::linked("viewer", vec![Selection::Field(Field::scalar("id"))]),
        )
        .unwrap();
        assert_eq!(viewer.identifying_ids(&Variables::new()).unwrap(), None);
    }
}
