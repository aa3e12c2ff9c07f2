use std::sync::Arc;

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};

use crate::{errors::StoreError, Selector};

/// Wire form of a patch handed to a store or patcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// RFC 7386 JSON merge patch.
    Merge,
    /// Server-side apply.
    Apply,
}

/// Raw verbs against the backing object store for a single resolved kind.
/// `namespace` is `None` for cluster-scoped kinds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create(
        &self,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    async fn delete(&self, namespace: Option<&str>, name: &str, force: bool)
        -> Result<(), StoreError>;

    /// List objects matching `selector`; `namespace: None` lists across all
    /// namespaces (or the cluster scope).
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        kind: PatchKind,
        data: Vec<u8>,
    ) -> Result<DynamicObject, StoreError>;
}

/// Local informer-equivalent view of one kind. Listing from a cache never
/// touches the remote store.
pub trait ObjectCache: Send + Sync {
    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<DynamicObject>;
}

/// Resolution result for one GVK: the verb client, an optional cache handle,
/// and the kind's scope.
pub struct ResolvedStore {
    pub store: Arc<dyn ObjectStore>,
    pub cache: Option<Arc<dyn ObjectCache>>,
    pub namespaced: bool,
}

/// Maps a GVK to a concrete store client. Owned by the surrounding system;
/// the engine resolves once per `process` call.
#[async_trait]
pub trait StoreResolver: Send + Sync {
    async fn resolve(&self, gvk: &GroupVersionKind) -> anyhow::Result<ResolvedStore>;
}
