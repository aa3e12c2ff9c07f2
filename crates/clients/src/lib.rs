//! Applyset kube wiring: GVK resolution, live store verbs and reflector caches.

#![forbid(unsafe_code)]

pub mod mem;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        reflector::{reflector, store::Writer, Store},
        watcher,
    },
    Client,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use applyset_core::{
    gvk_key, ObjectCache, ObjectStore, PatchKind, ResolvedStore, Selector, StoreError,
    StoreResolver,
};

/// Field manager name used for server-side apply patches.
pub const FIELD_MANAGER: &str = "applyset";

/// Kube client from the ambient kubeconfig/in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Find the served ApiResource and scope for a GVK via discovery.
async fn discover_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not served: {}", gvk_key(gvk)))
}

/// Store verbs for one resolved kind, backed by a dynamic `Api`.
pub struct LiveStore {
    client: Client,
    resource: ApiResource,
}

impl LiveStore {
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

fn map_kube_err(err: kube::Error) -> StoreError {
    if let kube::Error::Api(resp) = &err {
        if resp.code == 409 && resp.reason == "AlreadyExists" {
            return StoreError::AlreadyExists;
        }
        if resp.code == 404 {
            return StoreError::NotFound;
        }
    }
    StoreError::Other(err.into())
}

#[async_trait]
impl ObjectStore for LiveStore {
    async fn create(
        &self,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        self.api(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(map_kube_err)
    }

    async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        self.api(namespace).get_opt(name).await.map_err(map_kube_err)
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        force: bool,
    ) -> Result<(), StoreError> {
        let mut dp = DeleteParams::background();
        if force {
            dp = dp.grace_period(0);
        }
        self.api(namespace)
            .delete(name, &dp)
            .await
            .map(|_| ())
            .map_err(map_kube_err)
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_string());
        }
        let list = self.api(namespace).list(&lp).await.map_err(map_kube_err)?;
        Ok(list.items)
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        kind: PatchKind,
        data: Vec<u8>,
    ) -> Result<DynamicObject, StoreError> {
        let value: serde_json::Value = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Other(anyhow::Error::new(e).context("parsing patch body")))?;
        let api = self.api(namespace);
        let res = match kind {
            PatchKind::Merge => {
                api.patch(name, &PatchParams::default(), &Patch::Merge(&value)).await
            }
            PatchKind::Apply => {
                api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&value))
                    .await
            }
        };
        res.map_err(map_kube_err)
    }
}

/// GVK -> client resolution over kube discovery, with per-GVK caches
/// registered up front. Discovery results are memoized.
pub struct KubeResolver {
    client: Client,
    known: RwLock<HashMap<GroupVersionKind, (ApiResource, bool)>>,
    caches: HashMap<GroupVersionKind, Arc<dyn ObjectCache>>,
}

impl KubeResolver {
    pub fn new(client: Client) -> Self {
        Self { client, known: RwLock::new(HashMap::new()), caches: HashMap::new() }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    /// Attach a cache handle for one GVK; listing for that kind will then be
    /// served locally instead of from the remote store.
    pub fn with_cache(mut self, gvk: GroupVersionKind, cache: Arc<dyn ObjectCache>) -> Self {
        self.caches.insert(gvk, cache);
        self
    }

    async fn lookup(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        if let Some(found) = self.known.read().await.get(gvk) {
            return Ok(found.clone());
        }
        let found = discover_resource(self.client.clone(), gvk).await?;
        debug!(gvk = %gvk_key(gvk), namespaced = found.1, "resolved resource");
        self.known.write().await.insert(gvk.clone(), found.clone());
        Ok(found)
    }
}

#[async_trait]
impl StoreResolver for KubeResolver {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedStore> {
        let (resource, namespaced) = self.lookup(gvk).await?;
        Ok(ResolvedStore {
            store: Arc::new(LiveStore::new(self.client.clone(), resource)),
            cache: self.caches.get(gvk).cloned(),
            namespaced,
        })
    }
}

/// Cache handle backed by a reflector store fed from a watch.
pub struct ReflectorCache {
    reader: Store<DynamicObject>,
}

impl ReflectorCache {
    pub fn new(reader: Store<DynamicObject>) -> Self {
        Self { reader }
    }

    /// Start a watch for `resource` and return a cache over its reflector
    /// store, plus the driver task handle.
    pub fn spawn(
        client: Client,
        resource: ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &resource),
            None => Api::all_with(client, &resource),
        };
        let mut cfg = watcher::Config::default();
        if !selector.is_empty() {
            cfg = cfg.labels(&selector.to_string());
        }
        let writer = Writer::<DynamicObject>::new(resource.clone());
        let reader = writer.as_reader();
        let handle = tokio::spawn(async move {
            let stream = reflector(writer, watcher::watcher(api, cfg));
            futures::pin_mut!(stream);
            loop {
                match stream.try_next().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!("reflector stream ended");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "reflector stream failed");
                        break;
                    }
                }
            }
        });
        (Arc::new(Self { reader }), handle)
    }
}

impl ObjectCache for ReflectorCache {
    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<DynamicObject> {
        self.reader
            .state()
            .into_iter()
            .filter(|obj| match namespace {
                Some(ns) => obj.metadata.namespace.as_deref() == Some(ns),
                None => true,
            })
            .filter(|obj| selector.matches(obj.metadata.labels.as_ref()))
            .map(|obj| (*obj).clone())
            .collect()
    }
}
