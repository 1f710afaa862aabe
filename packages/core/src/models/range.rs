//! Connection ranges
//!
//! A connection record keeps the ordered list of edges it has seen so far,
//! plus whether more pages exist on either end. Reads slice a window out of
//! that list using the `first`/`last`/`after`/`before` arguments; payload
//! writes merge newly fetched pages into it.

use crate::models::record::DataId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One edge of a connection, in range order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeEdge {
    pub edge_id: DataId,
    pub node_id: DataId,
    pub cursor: Option<String>,
}

/// Pagination arguments resolved against variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeCalls {
    pub first: Option<usize>,
    pub last: Option<usize>,
    pub after: Option<String>,
    pub before: Option<String>,
}

/// Page boundaries reported alongside a window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

impl PageInfo {
    /// Field value for a `pageInfo` selection with the given response key
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "hasNextPage" => Some(json!(self.has_next_page)),
            "hasPreviousPage" => Some(json!(self.has_previous_page)),
            "startCursor" => Some(json!(self.start_cursor)),
            "endCursor" => Some(json!(self.end_cursor)),
            _ => None,
        }
    }
}

/// Edges visible for one set of range calls
#[derive(Debug, Clone, PartialEq)]
pub struct RangeWindow {
    pub edges: Vec<RangeEdge>,
    pub page_info: PageInfo,
}

/// Where a mutation places a newly added edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeBehavior {
    Append,
    Prepend,
    Ignore,
}

/// Known edges of a connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub edges: Vec<RangeEdge>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl Range {
    pub fn edge_ids(&self) -> impl Iterator<Item = &str> {
        self.edges.iter().map(|edge| edge.edge_id.as_str())
    }

    fn position_of_cursor(&self, cursor: &str) -> Option<usize> {
        self.edges
            .iter()
            .position(|edge| edge.cursor.as_deref() == Some(cursor))
    }

    /// Slice the window described by `calls`
    ///
    /// Returns `None` when the known edges cannot satisfy the request: a
    /// cursor that is not in the range, or a window that runs past the known
    /// edges while the range reports more pages on that side.
    pub fn retrieve(&self, calls: &RangeCalls) -> Option<RangeWindow> {
        let start = match &calls.after {
            Some(cursor) => self.position_of_cursor(cursor)? + 1,
            None => 0,
        };
        let end = match &calls.before {
            Some(cursor) => self.position_of_cursor(cursor)?,
            None => self.edges.len(),
        };
        let available = if start <= end {
            &self.edges[start..end]
        } else {
            &self.edges[0..0]
        };

        // Whether anything beyond the known slice exists on each side
        let more_after = calls.before.is_some() || self.has_next_page;
        let more_before = calls.after.is_some() || self.has_previous_page;

        let (edges, has_next_page, has_previous_page) = match (calls.first, calls.last) {
            (Some(first), _) => {
                if available.len() < first && calls.before.is_none() && self.has_next_page {
                    return None;
                }
                let take = first.min(available.len());
                let has_next = available.len() > first || more_after;
                (available[..take].to_vec(), has_next, more_before)
            }
            (None, Some(last)) => {
                if available.len() < last && calls.after.is_none() && self.has_previous_page {
                    return None;
                }
                let skip = available.len().saturating_sub(last);
                let has_previous = available.len() > last || more_before;
                (available[skip..].to_vec(), more_after, has_previous)
            }
            (None, None) => (available.to_vec(), more_after, more_before),
        };

        let page_info = PageInfo {
            has_next_page,
            has_previous_page,
            start_cursor: edges.first().and_then(|edge| edge.cursor.clone()),
            end_cursor: edges.last().and_then(|edge| edge.cursor.clone()),
        };
        Some(RangeWindow { edges, page_info })
    }

    /// Merge a fetched page into the range
    pub fn apply_page(
        &mut self,
        calls: &RangeCalls,
        edges: Vec<RangeEdge>,
        has_next_page: bool,
        has_previous_page: bool,
    ) {
        if let Some(cursor) = &calls.after {
            let keep = self
                .position_of_cursor(cursor)
                .map(|pos| pos + 1)
                .unwrap_or(self.edges.len());
            self.edges.truncate(keep);
            self.edges
                .retain(|existing| !edges.iter().any(|e| e.edge_id == existing.edge_id));
            self.edges.extend(edges);
            self.has_next_page = has_next_page;
        } else if let Some(cursor) = &calls.before {
            let tail = match self.position_of_cursor(cursor) {
                Some(pos) => self.edges.split_off(pos),
                None => std::mem::take(&mut self.edges),
            };
            let kept: Vec<RangeEdge> = tail
                .into_iter()
                .filter(|existing| !edges.iter().any(|e| e.edge_id == existing.edge_id))
                .collect();
            let mut merged = edges;
            merged.extend(kept);
            self.edges = merged;
            self.has_previous_page = has_previous_page;
        } else if calls.first.is_some() {
            self.edges = edges;
            self.has_next_page = has_next_page;
            self.has_previous_page = false;
        } else if calls.last.is_some() {
            self.edges = edges;
            self.has_previous_page = has_previous_page;
            self.has_next_page = false;
        } else {
            self.edges = edges;
            self.has_next_page = has_next_page;
            self.has_previous_page = has_previous_page;
        }
    }

    /// Insert an edge for a newly created node; existing edges for the same
    /// node are replaced in place
    pub fn add_edge(&mut self, edge: RangeEdge, behavior: RangeBehavior) {
        if let Some(existing) = self.edges.iter_mut().find(|e| e.node_id == edge.node_id) {
            *existing = edge;
            return;
        }
        match behavior {
            RangeBehavior::Append => self.edges.push(edge),
            RangeBehavior::Prepend => self.edges.insert(0, edge),
            RangeBehavior::Ignore => {}
        }
    }

    /// Drop every edge pointing at `node_id`; returns whether anything changed
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        let before = self.edges.len();
        self.edges.retain(|edge| edge.node_id != node_id);
        before != self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(n: usize) -> RangeEdge {
        RangeEdge {
            edge_id: format!("client:conn:{}", n),
            node_id: n.to_string(),
            cursor: Some(format!("c{}", n)),
        }
    }

    fn range_of(count: usize, has_next_page: bool) -> Range {
        Range {
            edges: (1..=count).map(edge).collect(),
            has_next_page,
            has_previous_page: false,
        }
    }

    fn first(n: usize) -> RangeCalls {
        RangeCalls {
            first: Some(n),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_window_within_known_edges() {
        let range = range_of(5, true);
        let window = range.retrieve(&first(2)).unwrap();
        assert_eq!(window.edges, vec![edge(1), edge(2)]);
        assert!(window.page_info.has_next_page);
        assert!(!window.page_info.has_previous_page);
        assert_eq!(window.page_info.start_cursor.as_deref(), Some("c1"));
        assert_eq!(window.page_info.end_cursor.as_deref(), Some("c2"));
    }

    #[test]
    fn test_first_window_past_known_edges_is_missing() {
        let range = range_of(2, true);
        assert!(range.retrieve(&first(3)).is_none());

        // Without more pages the short window is complete
        let complete = range_of(2, false);
        let window = complete.retrieve(&first(3)).unwrap();
        assert_eq!(window.edges.len(), 2);
        assert!(!window.page_info.has_next_page);
    }

    #[test]
    fn test_after_cursor_window() {
        let range = range_of(4, false);
        let calls = RangeCalls {
            first: Some(2),
            after: Some("c1".to_string()),
            ..Default::default()
        };
        let window = range.retrieve(&calls).unwrap();
        assert_eq!(window.edges, vec![edge(2), edge(3)]);
        assert!(window.page_info.has_next_page);
        assert!(window.page_info.has_previous_page);

        let unknown = RangeCalls {
            first: Some(2),
            after: Some("nope".to_string()),
            ..Default::default()
        };
        assert!(range.retrieve(&unknown).is_none());
    }

    #[test]
    fn test_last_window() {
        let range = range_of(4, false);
        let calls = RangeCalls {
            last: Some(1),
            ..Default::default()
        };
        let window = range.retrieve(&calls).unwrap();
        assert_eq!(window.edges, vec![edge(4)]);
        assert!(window.page_info.has_previous_page);
    }

    #[test]
    fn test_apply_page_after_cursor_appends() {
        let mut range = range_of(2, true);
        let calls = RangeCalls {
            first: Some(2),
            after: Some("c2".to_string()),
            ..Default::default()
        };
        range.apply_page(&calls, vec![edge(3), edge(4)], false, false);
        assert_eq!(range.edges.len(), 4);
        assert!(!range.has_next_page);
        assert_eq!(range.edges[3], edge(4));
    }

    #[test]
    fn test_apply_page_first_replaces() {
        let mut range = range_of(4, false);
        range.apply_page(&first(1), vec![edge(9)], true, false);
        assert_eq!(range.edges, vec![edge(9)]);
        assert!(range.has_next_page);
    }

    #[test]
    fn test_add_and_remove_edges() {
        let mut range = range_of(2, false);
        range.add_edge(edge(3), RangeBehavior::Prepend);
        assert_eq!(range.edges[0], edge(3));
        range.add_edge(edge(4), RangeBehavior::Append);
        assert_eq!(range.edges.last(), Some(&edge(4)));
        range.add_edge(edge(5), RangeBehavior::Ignore);
        assert_eq!(range.edges.len(), 4);

        assert!(range.remove_node("3"));
        assert!(!range.remove_node("3"));
        assert_eq!(range.edges.len(), 3);
    }
}
