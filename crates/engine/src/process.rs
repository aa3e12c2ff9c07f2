//! Per-kind orchestration: resolve, normalize, list, diff, execute.

use std::sync::Arc;

use anyhow::anyhow;
use kube::core::{DynamicObject, GroupVersionKind};
use metrics::counter;
use tracing::debug;

use applyset_core::{
    gvk_key, ApplyError, GroupKind, ObjectByKey, ObjectKey, ObjectStore, Selector, StoreError,
};

use crate::compare::{
    compare_objects, prepare_for_create, CompareOutcome, Patcher, PlanPatcher, StorePatcher,
};
use crate::diff::compare_sets;
use crate::normalize::{adjust_namespace, assign_owner_reference, clear_namespace};
use crate::DesiredSetApply;

enum CreateOutcome {
    Created,
    /// The slot was occupied by an unmanaged object; reclassify as update.
    TakenOver(Box<DynamicObject>),
}

impl DesiredSetApply {
    /// Reconcile one kind: list existing state, diff it against `objs`, and
    /// drive the create/update/delete phases, or record a plan instead.
    /// All failures go through the accumulating error sink.
    pub async fn process(
        &mut self,
        debug_id: &str,
        selector: &Selector,
        gvk: &GroupVersionKind,
        objs: ObjectByKey,
    ) {
        let key = gvk_key(gvk);

        let resolved = match self.resolver.resolve(gvk).await {
            Ok(r) => r,
            Err(err) => {
                self.errs
                    .report(err.context(format!("resolving client for {key} for {debug_id}")));
                return;
            }
        };
        let namespaced = resolved.namespaced;
        let store = resolved.store;

        let cache = self.caches.get(gvk).cloned().or(resolved.cache);
        if cache.is_none() && self.strict_caching {
            self.errs
                .report(anyhow!(ApplyError::NoCacheAvailable { gvk: key.clone() }));
            return;
        }

        if !namespaced && self.restrict_cluster_scoped {
            self.errs
                .report(anyhow!(ApplyError::ClusterScopedRestricted { gvk: key.clone() }));
            return;
        }

        let mut objs = objs;
        if self.set_owner_reference {
            if let Some(owner) = &self.owner {
                objs = assign_owner_reference(
                    owner,
                    self.owner_reference_controller,
                    self.owner_reference_block,
                    namespaced,
                    objs,
                );
            }
        }
        objs = if namespaced {
            adjust_namespace(&self.default_namespace, objs)
        } else {
            clear_namespace(objs)
        };

        let (mut existing, list_errs) = self
            .list_existing(namespaced, cache.as_ref(), &store, selector, &objs)
            .await;
        if !list_errs.is_empty() {
            self.errs
                .report(anyhow!(list_errs).context(format!("failed to list {key} for {debug_id}")));
        }

        let (mut to_create, mut to_delete, mut to_update) = compare_sets(&existing, &objs);
        to_delete = self.filter_cross_version(gvk, to_delete);

        if self.owner.is_none() && cache.is_none() && !to_delete.is_empty() {
            // Without an owner or a cache-backed view we cannot tell "not
            // desired" from "not yet seen".
            debug!(gvk = %key, debug_id, skipped = to_delete.len(), "skipping deletes without owner or cache");
            to_delete.clear();
        }

        let mut patcher: Arc<dyn Patcher> = match self.patchers.get(gvk) {
            Some(p) => p.clone(),
            None => Arc::new(StorePatcher::new(store.clone())),
        };
        let mut reconciler = self.reconcilers.get(gvk).cloned();

        let mut plan_patcher: Option<Arc<PlanPatcher>> = None;
        if self.plan_mode {
            self.plan.create.insert(key.clone(), to_create.clone());
            self.plan.delete.insert(key.clone(), to_delete.clone());
            let recorder = Arc::new(PlanPatcher::new(key.clone()));
            patcher = recorder.clone();
            plan_patcher = Some(recorder);
            reconciler = None;
            to_create.clear();
            to_delete.clear();
        }

        let batch_active = !to_create.is_empty() || !to_delete.is_empty();

        for k in &to_create {
            match self.create_one(&store, gvk, debug_id, k, &objs).await {
                Ok(CreateOutcome::Created) => {}
                Ok(CreateOutcome::TakenOver(existing_obj)) => {
                    existing.insert(k.clone(), *existing_obj);
                    to_update.push(k.clone());
                }
                Err(err) => self.errs.report(err),
            }
        }

        for k in &to_update {
            let (Some(existing_obj), Some(desired_obj)) = (existing.get(k), objs.get(k)) else {
                continue;
            };
            match compare_objects(
                gvk,
                k,
                reconciler.as_ref(),
                &patcher,
                debug_id,
                existing_obj,
                desired_obj,
                batch_active,
            )
            .await
            {
                Ok(CompareOutcome::ReplaceRequired) => {
                    self.delete_one(&store, gvk, debug_id, k, true).await;
                    counter!("applyset_replace_waits_total", 1u64);
                    self.errs.report(anyhow!(ApplyError::ReplaceWait {
                        gvk: key.clone(),
                        key: k.to_string(),
                        debug_id: debug_id.to_string(),
                    }));
                }
                Ok(_) => {}
                Err(err) => self.errs.report(
                    err.context(format!("failed to update {k} ({key}) for {debug_id}")),
                ),
            }
        }

        for k in &to_delete {
            self.delete_one(&store, gvk, debug_id, k, false).await;
        }

        if let Some(recorder) = plan_patcher {
            self.plan.update.extend(recorder.take());
        }
    }

    /// Drop delete candidates still desired under another version of the same
    /// group/kind, and candidates whose default-namespace-qualified key
    /// matches an unqualified desired entry. Two independent suppression
    /// rules, checked separately.
    fn filter_cross_version(&self, gvk: &GroupVersionKind, keys: Vec<ObjectKey>) -> Vec<ObjectKey> {
        let gk = GroupKind::of(gvk);
        keys.into_iter()
            .filter(|key| {
                if self.objs.contains(&gk, key) {
                    return false;
                }
                if key.namespace.as_deref() == Some(self.default_namespace.as_str())
                    && self.objs.contains(&gk, &ObjectKey::cluster(key.name.clone()))
                {
                    return false;
                }
                true
            })
            .collect()
    }

    async fn create_one(
        &self,
        store: &Arc<dyn ObjectStore>,
        gvk: &GroupVersionKind,
        debug_id: &str,
        k: &ObjectKey,
        objs: &ObjectByKey,
    ) -> anyhow::Result<CreateOutcome> {
        let key = gvk_key(gvk);
        let Some(obj) = objs.get(k) else {
            return Err(anyhow!("desired object missing for {k} ({key})"));
        };
        let obj = prepare_for_create(obj);
        match store.create(k.namespace.as_deref(), &obj).await {
            Ok(_) => {
                counter!("applyset_creates_total", 1u64);
                debug!(gvk = %key, key = %k, debug_id, "created object");
                Ok(CreateOutcome::Created)
            }
            Err(StoreError::AlreadyExists) => {
                match store.get(k.namespace.as_deref(), &k.name).await {
                    Ok(Some(existing_obj)) => {
                        counter!("applyset_takeovers_total", 1u64);
                        debug!(gvk = %key, key = %k, debug_id, "taking over existing object");
                        Ok(CreateOutcome::TakenOver(Box::new(existing_obj)))
                    }
                    _ => Err(anyhow!(StoreError::AlreadyExists)
                        .context(format!("failed to create {k} ({key}) for {debug_id}"))),
                }
            }
            Err(err) => Err(anyhow!(err)
                .context(format!("failed to create {k} ({key}) for {debug_id}"))),
        }
    }

    async fn delete_one(
        &mut self,
        store: &Arc<dyn ObjectStore>,
        gvk: &GroupVersionKind,
        debug_id: &str,
        k: &ObjectKey,
        force: bool,
    ) {
        let key = gvk_key(gvk);
        match store.delete(k.namespace.as_deref(), &k.name, force).await {
            Ok(()) => {
                counter!("applyset_deletes_total", 1u64);
                debug!(gvk = %key, key = %k, debug_id, force, "deleted object");
            }
            Err(StoreError::NotFound) => {
                debug!(gvk = %key, key = %k, debug_id, "object already gone");
            }
            Err(err) => self.errs.report(
                anyhow!(err).context(format!("failed to delete {k} ({key}) for {debug_id}")),
            ),
        }
    }
}
