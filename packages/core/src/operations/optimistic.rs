//! Write query inference
//!
//! A mutation's fat query bounds what it may change; a response says what it
//! actually returned. The fields written to the store are the intersection of
//! the two:
//!
//! - A fat query field is kept iff its response key is present in the
//!   response object, including when the value is `null`.
//! - Linked fields recurse into the response object.
//! - Plural fields recurse into every element and keep the union.
//! - Connection fields keep the `edges`, `pageInfo` and scalar children that
//!   are present; edges recurse like plural fields.
//! - Fields the fat query does not name are never written.
//!
//! An empty intersection means there is nothing to write. The same rule
//! derives the write query for optimistic responses (when the mutation gives
//! no explicit optimistic query) and for server responses.

use crate::models::{flatten_fields, Field, FieldKind, Selection};
use serde_json::{Map, Value};

/// Fat query restricted to what `response` contains; `None` if nothing overlaps
pub fn infer_optimistic_query(fat_query: &Field, response: &Value) -> Option<Field> {
    let Value::Object(object) = response else {
        return None;
    };
    let fields = intersect(&fat_query.selections, object);
    if fields.is_empty() {
        return None;
    }
    Some(Field {
        selections: fields.into_iter().map(Selection::Field).collect(),
        ..fat_query.clone()
    })
}

fn intersect(selections: &[Selection], object: &Map<String, Value>) -> Vec<Field> {
    let mut kept: Vec<Field> = Vec::new();
    for field in flatten_fields(selections) {
        let Some(value) = object.get(field.response_key()) else {
            continue;
        };
        let children = match (field.kind, value) {
            (FieldKind::Scalar, _) | (_, Value::Null) => Vec::new(),
            (FieldKind::Linked, Value::Object(child)) => intersect(&field.selections, child),
            (FieldKind::Plural, Value::Array(items)) => union_over(&field.selections, items),
            (FieldKind::Connection, Value::Object(child)) => intersect_connection(field, child),
            // Shape mismatch: the writer reports it
            _ => field_selections(field),
        };
        merge(&mut kept, with_selections(field, children));
    }
    kept
}

fn intersect_connection(field: &Field, object: &Map<String, Value>) -> Vec<Field> {
    let mut kept = Vec::new();
    for child in flatten_fields(&field.selections) {
        let Some(value) = object.get(child.response_key()) else {
            continue;
        };
        let children = match (child.name.as_str(), value) {
            ("edges", Value::Array(edges)) => union_over(&child.selections, edges),
            ("pageInfo", _) => field_selections(child),
            _ => Vec::new(),
        };
        merge(&mut kept, with_selections(child, children));
    }
    kept
}

fn union_over(selections: &[Selection], items: &[Value]) -> Vec<Field> {
    let mut kept = Vec::new();
    for item in items {
        if let Value::Object(object) = item {
            for field in intersect(selections, object) {
                merge(&mut kept, field);
            }
        }
    }
    kept
}

fn field_selections(field: &Field) -> Vec<Field> {
    flatten_fields(&field.selections).into_iter().cloned().collect()
}

fn with_selections(field: &Field, children: Vec<Field>) -> Field {
    Field {
        selections: children.into_iter().map(Selection::Field).collect(),
        ..field.clone()
    }
}

/// Add `field`, merging children into an existing field with the same response key
fn merge(fields: &mut Vec<Field>, field: Field) {
    let Some(index) = fields
        .iter()
        .position(|existing| existing.response_key() == field.response_key())
    else {
        fields.push(field);
        return;
    };
    let existing = &mut fields[index];
    let mut children: Vec<Field> = flatten_fields(&existing.selections).into_iter().cloned().collect();
    for child in flatten_fields(&field.selections) {
        merge(&mut children, child.clone());
    }
    existing.selections = children.into_iter().map(Selection::Field).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalar(name: &str) -> Selection {
        Selection::Field(Field::scalar(name))
    }

    fn keys(field: &Field) -> Vec<String> {
        flatten_fields(&field.selections)
            .iter()
            .map(|f| f.response_key().to_string())
            .collect()
    }

    fn fat_query() -> Field {
        Field::linked(
            "likeStory",
            vec![
                Selection::Field(Field::linked(
                    "story",
                    vec![scalar("id"), scalar("likeCount"), scalar("doesViewerLike")],
                )),
                Selection::Field(Field::plural("likers", vec![scalar("id"), scalar("name")])),
                scalar("clientMutationId"),
            ],
        )
    }

    #[test]
    fn test_keeps_only_fields_present_in_response() {
        let response = json!({"story": {"id": "s1", "doesViewerLike": true}, "unknown": 1});
        let query = infer_optimistic_query(&fat_query(), &response).unwrap();
        assert_eq!(keys(&query), vec!["story"]);
        let story = query.child("story").unwrap();
        assert_eq!(keys(story), vec!["id", "doesViewerLike"]);
    }

    #[test]
    fn test_null_values_are_kept() {
        let response = json!({"story": null});
        let query = infer_optimistic_query(&fat_query(), &response).unwrap();
        assert_eq!(keys(&query), vec!["story"]);
    }

    #[test]
    fn test_plural_fields_take_the_union() {
        let response = json!({"likers": [{"id": "1"}, {"name": "B"}]});
        let query = infer_optimistic_query(&fat_query(), &response).unwrap();
        let likers = query.child("likers").unwrap();
        assert_eq!(keys(likers), vec!["id", "name"]);
    }

    #[test]
    fn test_connection_keeps_present_children() {
        let fat = Field::linked(
            "addComment",
            vec![Selection::Field(Field::linked(
                "story",
                vec![
                    scalar("id"),
                    Selection::Field(Field::connection(
                        "comments",
                        vec![
                            scalar("count"),
                            Selection::Field(Field::plural(
                                "edges",
                                vec![
                                    scalar("cursor"),
                                    Selection::Field(Field::linked("node", vec![scalar("id"), scalar("body")])),
                                ],
                            )),
                            Selection::Field(Field::linked("pageInfo", vec![scalar("hasNextPage")])),
                        ],
                    )),
                ],
            ))],
        );
        let response = json!({"story": {"id": "s1", "comments": {"count": 2}}});
        let query = infer_optimistic_query(&fat, &response).unwrap();
        let comments = query.child("story").and_then(|s| s.child("comments")).unwrap();
        assert_eq!(keys(comments), vec!["count"]);
    }

    #[test]
    fn test_empty_intersection_is_none() {
        assert!(infer_optimistic_query(&fat_query(), &json!({"other": 1})).is_none());
        assert!(infer_optimistic_query(&fat_query(), &json!("not an object")).is_none());
    }
}
