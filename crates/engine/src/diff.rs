//! Set comparison: partition desired/existing keys into the three phases.

use kube::core::DynamicObject;

use applyset_core::{ObjectByKey, ObjectKey, LABEL_PRUNE};

/// An existing object is eligible for pruning unless it carries an explicit
/// `prune=false` label override.
pub(crate) fn should_prune(obj: &DynamicObject) -> bool {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_PRUNE))
        .map(String::as_str)
        != Some("false")
}

/// Partition every key into exactly one of create/delete/update. All three
/// sequences come back sorted by the key string form so execution order and
/// plan output are reproducible.
pub(crate) fn compare_sets(
    existing: &ObjectByKey,
    desired: &ObjectByKey,
) -> (Vec<ObjectKey>, Vec<ObjectKey>, Vec<ObjectKey>) {
    let mut to_create = Vec::new();
    let mut to_delete = Vec::new();
    let mut to_update = Vec::new();

    for key in desired.keys() {
        if existing.contains_key(key) {
            to_update.push(key.clone());
        } else {
            to_create.push(key.clone());
        }
    }

    for (key, obj) in existing.iter() {
        if !desired.contains_key(key) && should_prune(obj) {
            to_delete.push(key.clone());
        }
    }

    to_create.sort();
    to_delete.sort();
    to_update.sort();

    (to_create, to_delete, to_update)
}
