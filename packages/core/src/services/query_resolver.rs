//! Query Resolver
//!
//! Memoized fragment resolution with fine-grained invalidation.
//!
//! # Architecture
//!
//! Each resolved pointer gets a cache entry holding the materialized result
//! (behind an `Arc`, so callers compare results with `Arc::ptr_eq`), the set
//! of records the read depended on, and a change subscription for exactly
//! that set. The resolver also holds one garbage collection reference per
//! dependency.
//!
//! When a dependency changes the entry is re-read immediately and the owner
//! callback runs once per change batch, however many entries the batch hit.
//!
//! Plural pointers are resolved element by element. An element whose
//! dependencies did not change keeps its previous result, and the array itself
//! is only rebuilt when some element changed.

use crate::db::{StoreData, StoreError, Subscription};
use crate::models::{DataId, Fragment, FragmentPointer, PointerKey, Variables};
use crate::services::query_reader::{read_query_data, ReadOptions};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

/// Result of resolving a pointer
#[derive(Debug, Clone)]
pub enum Resolved {
    Single(Arc<Value>),
    Plural(Arc<Vec<Arc<Value>>>),
}

impl Resolved {
    /// Whether both results are the same allocation
    pub fn ptr_eq(&self, other: &Resolved) -> bool {
        match (self, other) {
            (Resolved::Single(a), Resolved::Single(b)) => Arc::ptr_eq(a, b),
            (Resolved::Plural(a), Resolved::Plural(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_single(&self) -> Option<&Arc<Value>> {
        match self {
            Resolved::Single(value) => Some(value),
            Resolved::Plural(_) => None,
        }
    }

    pub fn as_plural(&self) -> Option<&Arc<Vec<Arc<Value>>>> {
        match self {
            Resolved::Plural(items) => Some(items),
            Resolved::Single(_) => None,
        }
    }

    /// Owned JSON copy of the result
    pub fn to_value(&self) -> Value {
        match self {
            Resolved::Single(value) => value.as_ref().clone(),
            Resolved::Plural(items) => {
                Value::Array(items.iter().map(|item| item.as_ref().clone()).collect())
            }
        }
    }
}

struct Entry {
    data_id: DataId,
    fragment: Arc<Fragment>,
    variables: Variables,
    result: Arc<Value>,
    data_ids: BTreeSet<DataId>,
    stale: bool,
    _subscription: Subscription,
}

struct PluralEntry {
    result: Arc<Vec<Arc<Value>>>,
}

#[derive(Default)]
struct ResolverState {
    entries: HashMap<PointerKey, Entry>,
    plural: HashMap<PointerKey, PluralEntry>,
    last_notified_batch: Option<u64>,
}

struct ResolverInner {
    store: Arc<StoreData>,
    state: Mutex<ResolverState>,
    on_change: Box<dyn Fn() + Send + Sync>,
}

/// Caches resolved fragment data for one owner
pub struct QueryResolver {
    inner: Arc<ResolverInner>,
}

impl QueryResolver {
    /// Create a resolver; `on_change` runs after cached data was re-read
    pub fn new<F>(store: Arc<StoreData>, on_change: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ResolverInner {
                store,
                state: Mutex::new(ResolverState::default()),
                on_change: Box::new(on_change),
            }),
        }
    }

    /// Resolve a pointer, returning the cached result while it is current
    pub fn resolve(&self, pointer: &FragmentPointer) -> Result<Resolved, StoreError> {
        let key = pointer.key();
        if !pointer.is_plural() {
            let data_id = pointer.data_ids().into_iter().next().unwrap_or_default();
            let result = self.inner.resolve_entry(
                &key,
                &data_id,
                pointer.fragment(),
                pointer.variables(),
            )?;
            return Ok(Resolved::Single(result));
        }

        let items = pointer
            .data_ids()
            .iter()
            .map(|data_id| {
                self.inner.resolve_entry(
                    &key.element(data_id),
                    data_id,
                    pointer.fragment(),
                    pointer.variables(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.inner.state.lock();
        if let Some(previous) = state.plural.get(&key) {
            let unchanged = previous.result.len() == items.len()
                && previous
                    .result
                    .iter()
                    .zip(&items)
                    .all(|(old, new)| Arc::ptr_eq(old, new));
            if unchanged {
                return Ok(Resolved::Plural(previous.result.clone()));
            }
        }
        let result = Arc::new(items);
        state.plural.insert(
            key,
            PluralEntry {
                result: result.clone(),
            },
        );
        Ok(Resolved::Plural(result))
    }

    /// Records the cached result for a (singular) pointer depends on
    pub fn data_ids(&self, pointer: &FragmentPointer) -> Option<BTreeSet<DataId>> {
        let key = pointer.key();
        let state = self.inner.state.lock();
        if pointer.is_plural() {
            let mut ids = BTreeSet::new();
            for data_id in pointer.data_ids() {
                ids.extend(state.entries.get(&key.element(&data_id))?.data_ids.iter().cloned());
            }
            Some(ids)
        } else {
            state.entries.get(&key).map(|entry| entry.data_ids.clone())
        }
    }

    /// Number of cached entries (plural elements count individually)
    pub fn entry_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Drop every cached result, subscription and reference count
    pub fn reset(&self) {
        let entries = {
            let mut state = self.inner.state.lock();
            state.plural.clear();
            state.last_notified_batch = None;
            std::mem::take(&mut state.entries)
        };
        tracing::debug!("Resetting resolver with {} entries", entries.len());
        if let Some(gc) = self.inner.store.gc() {
            for entry in entries.values() {
                gc.decrement_all(&entry.data_ids);
            }
        }
    }
}

impl Drop for QueryResolver {
    fn drop(&mut self) {
        self.reset();
    }
}

impl ResolverInner {
    fn resolve_entry(
        self: &Arc<Self>,
        key: &PointerKey,
        data_id: &str,
        fragment: &Arc<Fragment>,
        variables: &Variables,
    ) -> Result<Arc<Value>, StoreError> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(key) {
            if !entry.stale {
                return Ok(entry.result.clone());
            }
        }

        // A failed read leaves any previous entry in place
        let read = self.store.read(|records| {
            read_query_data(
                records,
                &fragment.selections,
                data_id,
                variables,
                ReadOptions::default(),
            )
        })?;

        let previous_ids = state.entries.get(key).map(|entry| entry.data_ids.clone());
        if let Some(gc) = self.store.gc() {
            gc.increment_all(&read.data_ids);
            if let Some(previous_ids) = &previous_ids {
                gc.decrement_all(previous_ids);
            }
        }

        let weak: Weak<ResolverInner> = Arc::downgrade(self);
        let listener_key = key.clone();
        let subscription = self.store.emitter().add_listener_for_ids(
            read.data_ids.iter().cloned(),
            move |change| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_change(&listener_key, change.batch);
                }
            },
        );

        let result = Arc::new(read.data);
        tracing::debug!(
            "Resolved fragment '{}' at '{}' ({} dependencies)",
            fragment.name,
            data_id,
            read.data_ids.len()
        );
        state.entries.insert(
            key.clone(),
            Entry {
                data_id: data_id.to_string(),
                fragment: fragment.clone(),
                variables: variables.clone(),
                result: result.clone(),
                data_ids: read.data_ids,
                stale: false,
                _subscription: subscription,
            },
        );
        Ok(result)
    }

    fn handle_change(self: &Arc<Self>, key: &PointerKey, batch: u64) {
        let (params, notify) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                // Reset while the batch was being delivered
                return;
            };
            entry.stale = true;
            let params = (
                entry.data_id.clone(),
                entry.fragment.clone(),
                entry.variables.clone(),
            );
            let notify = state.last_notified_batch != Some(batch);
            state.last_notified_batch = Some(batch);
            (params, notify)
        };

        let (data_id, fragment, variables) = params;
        if let Err(error) = self.resolve_entry(key, &data_id, &fragment, &variables) {
            tracing::warn!(
                "Eager re-resolution of '{}' at '{}' failed: {}",
                fragment.name,
                data_id,
                error
            );
        }
        if notify {
            (self.on_change)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::WriteLayer;
    use crate::models::{Field, Selection};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn user_fragment() -> Arc<Fragment> {
        Fragment::new(
            "UserName",
            "User",
            vec![Selection::Field(Field::scalar("name"))],
        )
        .unwrap()
    }

    fn put_name(store: &StoreData, id: &str, name: &str) {
        store
            .update(WriteLayer::Authoritative, |writer| {
                writer.put_record(id);
                writer.put_scalar(id, "name", json!(name));
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_resolution_is_memoized_until_a_dependency_changes() {
        let store = Arc::new(StoreData::new(&StoreConfig::default()));
        put_name(&store, "1", "Ada");
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let resolver = QueryResolver::new(store.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let pointer = FragmentPointer::new("1", user_fragment()).unwrap();

        let first = resolver.resolve(&pointer).unwrap();
        let second = resolver.resolve(&pointer).unwrap();
        assert!(first.ptr_eq(&second));

        put_name(&store, "1", "Grace");
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        let third = resolver.resolve(&pointer).unwrap();
        assert!(!third.ptr_eq(&first));
        assert_eq!(third.to_value()["name"], json!("Grace"));

        // Writing the same value again is not a change
        put_name(&store, "1", "Grace");
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owner_is_notified_once_per_batch() {
        let store = Arc::new(StoreData::new(&StoreConfig::default()));
        put_name(&store, "1", "A");
        put_name(&store, "2", "B");
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let resolver = QueryResolver::new(store.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let fragment = user_fragment();
        resolver.resolve(&FragmentPointer::new("1", fragment.clone()).unwrap()).unwrap();
        resolver.resolve(&FragmentPointer::new("2", fragment).unwrap()).unwrap();

        store
            .update(WriteLayer::Authoritative, |writer| {
                writer.put_scalar("1", "name", json!("A2"));
                writer.put_scalar("2", "name", json!("B2"));
                Ok::<_, StoreError>(())
            })
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_read_keeps_previous_result() {
        let store = Arc::new(StoreData::new(&StoreConfig::default()));
        let resolver = QueryResolver::new(store.clone(), || {});
        let pointer = FragmentPointer::new("missing", user_fragment()).unwrap();
        assert!(matches!(
            resolver.resolve(&pointer),
            Err(StoreError::MissingData { .. })
        ));
        assert_eq!(resolver.entry_count(), 0);
    }

    #[test]
    fn test_reset_releases_references() {
        let store = Arc::new(StoreData::new(&StoreConfig::default()));
        put_name(&store, "1", "Ada");
        let resolver = QueryResolver::new(store.clone(), || {});
        let pointer = FragmentPointer::new("1", user_fragment()).unwrap();
        resolver.resolve(&pointer).unwrap();

        let gc = store.gc().unwrap().clone();
        assert_eq!(gc.ref_count("1"), 1);
        assert_eq!(store.emitter().listener_count(), 1);

        resolver.reset();
        assert_eq!(gc.ref_count("1"), 0);
        assert_eq!(store.emitter().listener_count(), 0);
        assert_eq!(resolver.entry_count(), 0);
    }
}
