//! State lister: discover the currently-existing objects of one kind, from a
//! cache when available, otherwise from the remote store.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use tokio::task::JoinSet;

use applyset_core::{Errors, ObjectByKey, ObjectCache, ObjectStore, Selector};

use crate::DesiredSetApply;

impl DesiredSetApply {
    /// Returned errors mean "listing incomplete", never "discard the map":
    /// partial results under-approximate existing state, which is the safe
    /// direction (fewer delete candidates, take-over covers creates).
    pub(crate) async fn list_existing(
        &self,
        namespaced: bool,
        cache: Option<&Arc<dyn ObjectCache>>,
        store: &Arc<dyn ObjectStore>,
        selector: &Selector,
        desired: &ObjectByKey,
    ) -> (ObjectByKey, Errors) {
        if let Some(cache) = cache {
            let ns = if namespaced { self.lister_namespace.as_deref() } else { None };
            let mut objs = ObjectByKey::new();
            let mut errs = Errors::new();
            for obj in cache.list(ns, selector) {
                if let Err(e) = objs.insert_object(obj) {
                    errs.push(anyhow::Error::new(e).context("keying cached object"));
                }
            }
            return (objs, errs);
        }

        // Cluster-scoped kinds list in one unscoped call.
        if !namespaced {
            return all_namespace_list(store, selector).await;
        }

        if self.owner.is_some() && self.lister_namespace.is_none() {
            // Owned objects may live in namespaces no longer present in the
            // desired set; list everywhere so they still get cleaned up.
            return all_namespace_list(store, selector).await;
        }

        let namespaces = match &self.lister_namespace {
            Some(ns) => vec![ns.clone()],
            None => desired.namespaces(),
        };
        multi_namespace_list(store.clone(), namespaces, selector.clone()).await
    }
}

async fn all_namespace_list(
    store: &Arc<dyn ObjectStore>,
    selector: &Selector,
) -> (ObjectByKey, Errors) {
    let mut objs = ObjectByKey::new();
    let mut errs = Errors::new();
    match store.list(None, selector).await {
        Ok(listed) => {
            for obj in listed {
                if let Err(e) = objs.insert_object(obj) {
                    errs.push(anyhow::Error::new(e).context("keying listed object"));
                }
            }
        }
        Err(e) => errs.push(anyhow::Error::new(e).context("listing all namespaces")),
    }
    (objs, errs)
}

/// List the given namespaces concurrently, one task each, merging results
/// under a mutex. The first failing namespace cancels outstanding siblings;
/// results already merged are kept.
async fn multi_namespace_list(
    store: Arc<dyn ObjectStore>,
    namespaces: Vec<String>,
    selector: Selector,
) -> (ObjectByKey, Errors) {
    let merged = Arc::new(Mutex::new(ObjectByKey::new()));
    let mut errs = Errors::new();
    let mut tasks: JoinSet<anyhow::Result<Vec<anyhow::Error>>> = JoinSet::new();

    for namespace in namespaces {
        let store = store.clone();
        let selector = selector.clone();
        let merged = merged.clone();
        tasks.spawn(async move {
            let listed = store
                .list(Some(&namespace), &selector)
                .await
                .with_context(|| format!("listing namespace {namespace}"))?;
            let mut soft = Vec::new();
            let mut guard = merged.lock().unwrap_or_else(|e| e.into_inner());
            for obj in listed {
                if let Err(e) = guard.insert_object(obj) {
                    soft.push(
                        anyhow::Error::new(e)
                            .context(format!("keying object in namespace {namespace}")),
                    );
                }
            }
            Ok(soft)
        });
    }

    let mut aborted = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(soft)) => errs.extend(soft),
            Ok(Err(err)) => {
                errs.push(err);
                if !aborted {
                    tasks.abort_all();
                    aborted = true;
                }
            }
            Err(join_err) => {
                if !join_err.is_cancelled() {
                    errs.push(anyhow!(join_err).context("namespace list task"));
                }
            }
        }
    }

    let objs = match Arc::try_unwrap(merged) {
        Ok(m) => m.into_inner().unwrap_or_else(|e| e.into_inner()),
        Err(arc) => arc.lock().unwrap_or_else(|e| e.into_inner()).clone(),
    };
    (objs, errs)
}
