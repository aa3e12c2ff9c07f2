//! In-memory store, cache and resolver for tests and offline use.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta};

use applyset_core::{
    gvk_key, ApplyError, ObjectCache, ObjectKey, ObjectStore, PatchKind, ResolvedStore, Selector,
    StoreError, StoreResolver,
};

/// Convenience constructor for a dynamic object in tests.
pub fn make_object(
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
    data: serde_json::Value,
) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(|s| s.to_string()),
            ..Default::default()
        },
        data,
    }
}

/// One recorded mutating call against a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create(ObjectKey),
    Patch(ObjectKey),
    Delete { key: ObjectKey, force: bool },
}

#[derive(Default)]
struct MemInner {
    objects: HashMap<ObjectKey, DynamicObject>,
    mutations: Vec<Mutation>,
    fail_list_namespaces: HashSet<String>,
}

/// In-memory [`ObjectStore`] for one kind. Records every mutating verb so
/// tests can assert on what the engine did (or, in plan mode, did not do).
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an object into the store without recording a mutation.
    pub fn seed(&self, obj: DynamicObject) -> Result<ObjectKey, ApplyError> {
        let key = ObjectKey::for_object(&obj)?;
        self.lock().objects.insert(key.clone(), obj);
        Ok(key)
    }

    /// Make every `list` call scoped to `namespace` fail.
    pub fn fail_lists_in(&self, namespace: &str) {
        self.lock().fail_list_namespaces.insert(namespace.to_string());
    }

    pub fn get_object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn key_of(namespace: Option<&str>, name: &str) -> ObjectKey {
    ObjectKey { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
}

/// RFC 7386 merge semantics: objects merge recursively, `null` removes,
/// everything else replaces.
fn apply_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    let map = target.as_object_mut().expect("target coerced to object");
    for (k, pv) in patch_map {
        if pv.is_null() {
            map.remove(k);
            continue;
        }
        match map.get_mut(k) {
            Some(tv) if pv.is_object() && tv.is_object() => apply_merge(tv, pv),
            _ => {
                map.insert(k.clone(), pv.clone());
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create(
        &self,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = obj.metadata.name.as_deref().unwrap_or_default().to_string();
        let key = key_of(namespace, &name);
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        inner.objects.insert(key.clone(), obj.clone());
        inner.mutations.push(Mutation::Create(key));
        Ok(obj.clone())
    }

    async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self.lock().objects.get(&key_of(namespace, name)).cloned())
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        force: bool,
    ) -> Result<(), StoreError> {
        let key = key_of(namespace, name);
        let mut inner = self.lock();
        if inner.objects.remove(&key).is_none() {
            return Err(StoreError::NotFound);
        }
        inner.mutations.push(Mutation::Delete { key, force });
        Ok(())
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let inner = self.lock();
        if let Some(ns) = namespace {
            if inner.fail_list_namespaces.contains(ns) {
                return Err(StoreError::Other(anyhow!("list failed for namespace {ns}")));
            }
        }
        Ok(inner
            .objects
            .iter()
            .filter(|(key, _)| match namespace {
                Some(ns) => key.namespace.as_deref() == Some(ns),
                None => true,
            })
            .filter(|(_, obj)| selector.matches(obj.metadata.labels.as_ref()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        _kind: PatchKind,
        data: Vec<u8>,
    ) -> Result<DynamicObject, StoreError> {
        let patch: serde_json::Value = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Other(anyhow::Error::new(e).context("parsing patch body")))?;
        let key = key_of(namespace, name);
        let mut inner = self.lock();
        let Some(current) = inner.objects.get(&key) else {
            return Err(StoreError::NotFound);
        };
        let mut value = serde_json::to_value(current)
            .map_err(|e| StoreError::Other(anyhow::Error::new(e)))?;
        apply_merge(&mut value, &patch);
        let updated: DynamicObject = serde_json::from_value(value)
            .map_err(|e| StoreError::Other(anyhow::Error::new(e).context("patched object")))?;
        inner.objects.insert(key.clone(), updated.clone());
        inner.mutations.push(Mutation::Patch(key));
        Ok(updated)
    }
}

/// Static [`ObjectCache`] over a fixed object list.
#[derive(Default)]
pub struct StaticCache {
    objects: Vec<DynamicObject>,
}

impl StaticCache {
    pub fn new(objects: Vec<DynamicObject>) -> Self {
        Self { objects }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl ObjectCache for StaticCache {
    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<DynamicObject> {
        self.objects
            .iter()
            .filter(|obj| match namespace {
                Some(ns) => obj.metadata.namespace.as_deref() == Some(ns),
                None => true,
            })
            .filter(|obj| selector.matches(obj.metadata.labels.as_ref()))
            .cloned()
            .collect()
    }
}

struct MemEntry {
    store: Arc<MemoryStore>,
    cache: Option<Arc<dyn ObjectCache>>,
    namespaced: bool,
}

/// [`StoreResolver`] over registered in-memory kinds.
#[derive(Default)]
pub struct MemoryResolver {
    kinds: HashMap<GroupVersionKind, MemEntry>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gvk: GroupVersionKind, namespaced: bool, store: Arc<MemoryStore>) {
        self.kinds.insert(gvk, MemEntry { store, cache: None, namespaced });
    }

    pub fn register_with_cache(
        &mut self,
        gvk: GroupVersionKind,
        namespaced: bool,
        store: Arc<MemoryStore>,
        cache: Arc<dyn ObjectCache>,
    ) {
        self.kinds.insert(gvk, MemEntry { store, cache: Some(cache), namespaced });
    }
}

#[async_trait]
impl StoreResolver for MemoryResolver {
    async fn resolve(&self, gvk: &GroupVersionKind) -> anyhow::Result<ResolvedStore> {
        let entry = self
            .kinds
            .get(gvk)
            .ok_or_else(|| anyhow!("GVK not served: {}", gvk_key(gvk)))?;
        Ok(ResolvedStore {
            store: entry.store.clone(),
            cache: entry.cache.clone(),
            namespaced: entry.namespaced,
        })
    }
}
