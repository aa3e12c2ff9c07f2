//! Ownership and namespace normalization of the desired set.
//!
//! Every function here builds a fresh map from a snapshot of the old one;
//! the container being iterated is never mutated in place, and re-keyed
//! objects land in the new map under their new key.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use applyset_core::{ObjectByKey, Owner};

/// Stamp an owner reference onto every desired object the owner may claim.
///
/// Skips cluster-scoped targets under a namespaced owner (references never
/// cross the cluster-scope boundary) and namespaced targets living in a
/// different namespace than a namespaced owner. Namespace-less namespaced
/// targets adopt the owner's namespace and are re-keyed. Idempotent: an
/// existing reference with the owner's UID is left alone.
pub(crate) fn assign_owner_reference(
    owner: &Owner,
    controller: bool,
    block: bool,
    namespaced: bool,
    objs: ObjectByKey,
) -> ObjectByKey {
    let mut out = ObjectByKey::new();
    for (key, obj) in objs {
        if owner.namespaced && !namespaced {
            out.insert(key, obj);
            continue;
        }

        let mut assign_ns = false;
        if namespaced {
            if key.namespace.is_none() {
                assign_ns = true;
            } else if owner.namespaced && key.namespace != owner.namespace {
                // cannot own across namespaces
                out.insert(key, obj);
                continue;
            }
        }

        let mut key = key;
        let mut obj = obj;
        if assign_ns {
            key.namespace = owner.namespace.clone();
            obj.metadata.namespace = owner.namespace.clone();
        }

        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(OwnerReference {
                api_version: owner.api_version.clone(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
                controller: Some(controller),
                block_owner_deletion: Some(block),
            });
        }

        out.insert(key, obj);
    }
    out
}

/// Stamp the default namespace onto namespaced objects that carry none.
pub(crate) fn adjust_namespace(default_namespace: &str, objs: ObjectByKey) -> ObjectByKey {
    let mut out = ObjectByKey::new();
    for (mut key, mut obj) in objs {
        if key.namespace.is_none() {
            key.namespace = Some(default_namespace.to_string());
            obj.metadata.namespace = Some(default_namespace.to_string());
        }
        out.insert(key, obj);
    }
    out
}

/// Cluster-scoped kinds must never carry a namespace downstream.
pub(crate) fn clear_namespace(objs: ObjectByKey) -> ObjectByKey {
    let mut out = ObjectByKey::new();
    for (mut key, mut obj) in objs {
        if key.namespace.is_some() {
            key.namespace = None;
            obj.metadata.namespace = None;
        }
        out.insert(key, obj);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use applyset_clients::mem::make_object;
    use applyset_core::ObjectKey;

    fn owner() -> Owner {
        Owner {
            api_version: "example.io/v1".into(),
            kind: "App".into(),
            name: "app".into(),
            namespace: Some("ns1".into()),
            uid: "uid-1".into(),
            namespaced: true,
        }
    }

    fn keyed(objs: Vec<kube::core::DynamicObject>) -> ObjectByKey {
        let mut out = ObjectByKey::new();
        for obj in objs {
            out.insert_object(obj).unwrap();
        }
        out
    }

    #[test]
    fn owner_reference_is_idempotent() {
        let objs = keyed(vec![make_object("v1", "ConfigMap", Some("ns1"), "a", serde_json::json!({}))]);
        let once = assign_owner_reference(&owner(), true, false, true, objs);
        let twice = assign_owner_reference(&owner(), true, false, true, once);
        let obj = twice.get(&ObjectKey::namespaced("ns1", "a")).unwrap();
        let refs = obj.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "uid-1");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn namespaced_owner_never_claims_cluster_scoped_targets() {
        let objs = keyed(vec![make_object("v1", "Namespace", None, "system", serde_json::json!({}))]);
        let out = assign_owner_reference(&owner(), false, false, false, objs);
        let obj = out.get(&ObjectKey::cluster("system")).unwrap();
        assert!(obj.metadata.owner_references.is_none());
    }

    #[test]
    fn cross_namespace_targets_are_left_alone() {
        let objs = keyed(vec![make_object("v1", "ConfigMap", Some("other"), "a", serde_json::json!({}))]);
        let out = assign_owner_reference(&owner(), false, false, true, objs);
        let obj = out.get(&ObjectKey::namespaced("other", "a")).unwrap();
        assert!(obj.metadata.owner_references.is_none());
    }

    #[test]
    fn namespace_less_targets_adopt_the_owner_namespace_and_rekey() {
        let objs = keyed(vec![make_object("v1", "ConfigMap", None, "a", serde_json::json!({}))]);
        let out = assign_owner_reference(&owner(), false, false, true, objs);
        assert!(out.get(&ObjectKey::cluster("a")).is_none());
        let obj = out.get(&ObjectKey::namespaced("ns1", "a")).unwrap();
        assert_eq!(obj.metadata.namespace.as_deref(), Some("ns1"));
        assert!(obj.metadata.owner_references.is_some());
    }

    #[test]
    fn namespace_normalization_is_idempotent_and_total() {
        let objs = keyed(vec![
            make_object("v1", "ConfigMap", None, "a", serde_json::json!({})),
            make_object("v1", "ConfigMap", Some("ns2"), "b", serde_json::json!({})),
        ]);
        let once = adjust_namespace("default", objs);
        let twice = adjust_namespace("default", once.clone());
        assert!(once.keys().all(|k| k.namespace.is_some()));
        assert_eq!(once.sorted_keys(), twice.sorted_keys());
        assert!(once.contains_key(&ObjectKey::namespaced("default", "a")));
        assert!(once.contains_key(&ObjectKey::namespaced("ns2", "b")));

        let cleared = clear_namespace(twice);
        assert!(cleared.keys().all(|k| k.namespace.is_none()));
        let cleared_again = clear_namespace(cleared.clone());
        assert_eq!(cleared.sorted_keys(), cleared_again.sorted_keys());
    }
}
