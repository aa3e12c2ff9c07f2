//! Applyset core types: object identity, desired sets, plans and errors.

#![forbid(unsafe_code)]

mod errors;
mod plan;
mod store;

pub use errors::{ApplyError, Errors, StoreError};
pub use plan::{Plan, PlanUpdate};
pub use store::{ObjectCache, ObjectStore, PatchKind, ResolvedStore, StoreResolver};

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

/// Label recognized on existing objects to opt out of pruning.
pub const LABEL_PRUNE: &str = "applyset.dev/prune";

/// Namespace stamped on namespaced objects that do not carry one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Stable string form of a GVK, e.g. `v1/ConfigMap` or `apps/v1/Deployment`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// GVK of an object derived from its `apiVersion`/`kind` fields.
pub fn object_gvk(obj: &DynamicObject) -> Result<GroupVersionKind, ApplyError> {
    let types = obj.types.as_ref().ok_or(ApplyError::MissingTypeMeta)?;
    if types.api_version.is_empty() || types.kind.is_empty() {
        return Err(ApplyError::MissingTypeMeta);
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    Ok(GroupVersionKind { group, version, kind: types.kind.clone() })
}

/// Group+kind pair, the identity used when the same resources are tracked
/// under more than one API version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn of(gvk: &GroupVersionKind) -> Self {
        Self { group: gvk.group.clone(), kind: gvk.kind.clone() }
    }
}

/// Identity of an object within one kind. Cluster-scoped objects carry no
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    /// Key of a live object, taken from its metadata. Empty namespace strings
    /// collapse to `None` so cluster-scoped and namespaced listings key alike.
    pub fn for_object(obj: &DynamicObject) -> Result<Self, ApplyError> {
        let name = obj.metadata.name.clone().ok_or(ApplyError::MissingName)?;
        let namespace = obj.metadata.namespace.clone().filter(|ns| !ns.is_empty());
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Ord for ObjectKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for ObjectKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Objects of a single kind, keyed by namespace+name. Represents either the
/// desired or the existing state for one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ObjectByKey(HashMap<ObjectKey, DynamicObject>);

impl ObjectByKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object under the key derived from its metadata.
    pub fn insert_object(&mut self, obj: DynamicObject) -> Result<ObjectKey, ApplyError> {
        let key = ObjectKey::for_object(&obj)?;
        self.0.insert(key.clone(), obj);
        Ok(key)
    }

    /// Distinct namespaces referenced by the keys, sorted. Cluster-scoped
    /// keys contribute nothing.
    pub fn namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .0
            .keys()
            .filter_map(|k| k.namespace.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn sorted_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.0.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::ops::Deref for ObjectByKey {
    type Target = HashMap<ObjectKey, DynamicObject>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for ObjectByKey {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(ObjectKey, DynamicObject)> for ObjectByKey {
    fn from_iter<I: IntoIterator<Item = (ObjectKey, DynamicObject)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ObjectByKey {
    type Item = (ObjectKey, DynamicObject);
    type IntoIter = std::collections::hash_map::IntoIter<ObjectKey, DynamicObject>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The overall multi-kind desired collection for one apply run.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    objects: HashMap<GroupVersionKind, ObjectByKey>,
}

impl ObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        gvk: GroupVersionKind,
        obj: DynamicObject,
    ) -> Result<ObjectKey, ApplyError> {
        self.objects.entry(gvk).or_default().insert_object(obj)
    }

    /// Insert an object under the GVK carried in its own `apiVersion`/`kind`.
    pub fn add_object(&mut self, obj: DynamicObject) -> Result<ObjectKey, ApplyError> {
        let gvk = object_gvk(&obj)?;
        self.insert(gvk, obj)
    }

    /// Whether any tracked version of `gk` holds an object under `key`.
    pub fn contains(&self, gk: &GroupKind, key: &ObjectKey) -> bool {
        self.objects
            .iter()
            .any(|(gvk, objs)| gvk.group == gk.group && gvk.kind == gk.kind && objs.contains_key(key))
    }

    /// GVKs in deterministic order (sorted by string form).
    pub fn gvks(&self) -> Vec<GroupVersionKind> {
        let mut out: Vec<GroupVersionKind> = self.objects.keys().cloned().collect();
        out.sort_by_key(gvk_key);
        out
    }

    pub fn get(&self, gvk: &GroupVersionKind) -> Option<&ObjectByKey> {
        self.objects.get(gvk)
    }

    pub fn len(&self) -> usize {
        self.objects.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The object whose lifecycle the desired set is bound to. Without an owner
/// the engine never proposes deletions.
#[derive(Debug, Clone)]
pub struct Owner {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
    pub namespaced: bool,
}

impl Owner {
    /// Build an owner descriptor from a live object. `namespaced` is the
    /// resolved scope of the owner's own kind, not of the targets.
    pub fn from_object(obj: &DynamicObject, namespaced: bool) -> Result<Self, ApplyError> {
        let types = obj.types.as_ref().ok_or(ApplyError::MissingTypeMeta)?;
        let name = obj.metadata.name.clone().ok_or(ApplyError::MissingName)?;
        let uid = obj.metadata.uid.clone().ok_or(ApplyError::MissingUid)?;
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            name,
            namespace: obj.metadata.namespace.clone().filter(|ns| !ns.is_empty()),
            uid,
            namespaced,
        })
    }
}

/// Equality-based label selector. Renders to the standard
/// `key=value,key2=value2` query form for remote listing and matches label
/// maps locally for cache-backed listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let Some(labels) = labels else { return false };
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(kube::core::TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                namespace: ns.map(|s| s.to_string()),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn key_string_form_and_order() {
        let a = ObjectKey::namespaced("ns1", "a");
        let b = ObjectKey::cluster("b");
        assert_eq!(a.to_string(), "ns1/a");
        assert_eq!(b.to_string(), "b");
        let mut keys = vec![a.clone(), b.clone(), ObjectKey::namespaced("ns1", "b")];
        keys.sort();
        assert_eq!(keys[0], b);
        assert_eq!(keys[1], a);
    }

    #[test]
    fn empty_namespace_collapses_to_none() {
        let o = obj("v1", "Namespace", Some(""), "system");
        let key = ObjectKey::for_object(&o).unwrap();
        assert_eq!(key, ObjectKey::cluster("system"));
    }

    #[test]
    fn object_gvk_parses_grouped_and_core_versions() {
        let core = object_gvk(&obj("v1", "ConfigMap", None, "x")).unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str()), ("", "v1"));
        let grouped = object_gvk(&obj("apps/v1", "Deployment", None, "x")).unwrap();
        assert_eq!(grouped.group, "apps");
        assert_eq!(gvk_key(&grouped), "apps/v1/Deployment");
    }

    #[test]
    fn set_contains_spans_versions_of_a_group_kind() {
        let mut set = ObjectSet::new();
        set.add_object(obj("example.io/v2", "Widget", Some("ns1"), "w"))
            .unwrap();
        let gk = GroupKind { group: "example.io".into(), kind: "Widget".into() };
        assert!(set.contains(&gk, &ObjectKey::namespaced("ns1", "w")));
        assert!(!set.contains(&gk, &ObjectKey::cluster("w")));
    }

    #[test]
    fn selector_renders_and_matches() {
        let sel = Selector::new().matching("app", "demo").matching("tier", "web");
        assert_eq!(sel.to_string(), "app=demo,tier=web");
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "demo".to_string());
        assert!(!sel.matches(Some(&labels)));
        labels.insert("tier".to_string(), "web".to_string());
        assert!(sel.matches(Some(&labels)));
        assert!(Selector::new().matches(None));
    }
}
