use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ObjectKey;

/// Dry-run output: every mutation the engine would have performed, keyed by
/// the GVK string form. The sole externally serializable artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    /// GVK key -> ordered keys to create.
    pub create: BTreeMap<String, Vec<ObjectKey>>,
    /// GVK key -> ordered keys to delete.
    pub delete: BTreeMap<String, Vec<ObjectKey>>,
    /// Patch bodies that would have been applied, in execution order.
    pub update: Vec<PlanUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanUpdate {
    pub gvk: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Sanitized patch body, JSON text.
    pub patch: String,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.create.values().all(|v| v.is_empty())
            && self.delete.values().all(|v| v.is_empty())
            && self.update.is_empty()
    }

    pub fn record_update(
        &mut self,
        gvk: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
        patch: impl Into<String>,
    ) {
        self.update.push(PlanUpdate {
            gvk: gvk.into(),
            namespace,
            name: name.into(),
            patch: patch.into(),
        });
    }
}
