//! Fragment pointers
//!
//! A pointer names "this fragment applied at these records, with these
//! variables". Resolvers cache by the pointer's key, so two pointers built
//! independently for the same records, fragment and variables share one
//! cached result.

use crate::db::StoreError;
use crate::models::query::{Fragment, FragmentId, Variables};
use crate::models::record::DataId;
use std::sync::Arc;

/// Cache identity of a pointer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointerKey {
    data_ids: Vec<DataId>,
    plural: bool,
    fragment_id: FragmentId,
    variables: String,
}

impl PointerKey {
    /// Key of one element of a plural pointer
    pub(crate) fn element(&self, data_id: &str) -> PointerKey {
        PointerKey {
            data_ids: vec![data_id.to_string()],
            plural: false,
            fragment_id: self.fragment_id.clone(),
            variables: self.variables.clone(),
        }
    }
}

/// Root record(s) of a pointer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerIds {
    Singular(DataId),
    Plural(Vec<DataId>),
}

/// A fragment applied at one or more root records
#[derive(Debug, Clone)]
pub struct FragmentPointer {
    ids: PointerIds,
    fragment: Arc<Fragment>,
    variables: Variables,
}

impl FragmentPointer {
    pub fn new(data_id: impl Into<DataId>, fragment: Arc<Fragment>) -> Result<Self, StoreError> {
        if fragment.plural {
            return Err(StoreError::invariant_violation(format!(
                "fragment '{}' is plural and needs a list of ids",
                fragment.name
            )));
        }
        Ok(Self {
            ids: PointerIds::Singular(data_id.into()),
            fragment,
            variables: Variables::new(),
        })
    }

    pub fn new_plural(data_ids: Vec<DataId>, fragment: Arc<Fragment>) -> Result<Self, StoreError> {
        if !fragment.plural {
            return Err(StoreError::invariant_violation(format!(
                "fragment '{}' is not plural",
                fragment.name
            )));
        }
        Ok(Self {
            ids: PointerIds::Plural(data_ids),
            fragment,
            variables: Variables::new(),
        })
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn ids(&self) -> &PointerIds {
        &self.ids
    }

    pub fn data_ids(&self) -> Vec<DataId> {
        match &self.ids {
            PointerIds::Singular(id) => vec![id.clone()],
            PointerIds::Plural(ids) => ids.clone(),
        }
    }

    pub fn fragment(&self) -> &Arc<Fragment> {
        &self.fragment
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn is_plural(&self) -> bool {
        matches!(self.ids, PointerIds::Plural(_))
    }

    pub fn key(&self) -> PointerKey {
        PointerKey {
            data_ids: self.data_ids(),
            plural: self.is_plural(),
            fragment_id: self.fragment.id().clone(),
            // BTreeMap serializes with sorted keys
            variables: serde_json::to_string(&self.variables).unwrap_or_default(),
        }
    }
}
