//! Applyset engine: per-kind desired-set convergence (diff + execute).
//!
//! The engine reconciles a desired collection of objects against what the
//! backing store currently holds: it lists existing state, partitions keys
//! into create/update/delete, normalizes ownership and namespace placement,
//! and drives the three phases, either mutating the store or recording a
//! [`Plan`] in dry-run mode.

#![forbid(unsafe_code)]

mod compare;
mod diff;
mod list;
mod normalize;
mod process;

pub use compare::{
    compare_objects, merge_patch, prepare_for_create, replace_on_change, sanitize_patch,
    CompareOutcome, PatchResult, Patcher, PlanPatcher, Reconciler, StorePatcher,
};

use std::collections::HashMap;
use std::sync::Arc;

use kube::core::GroupVersionKind;
use tracing::warn;

use applyset_core::{
    gvk_key, Errors, ObjectCache, ObjectSet, Owner, Plan, Selector, StoreResolver,
    DEFAULT_NAMESPACE,
};

/// Accumulates independent failures so one failing object never prevents the
/// rest of the batch from being attempted.
#[derive(Debug, Default)]
pub struct ErrorSink {
    errs: Errors,
}

impl ErrorSink {
    pub fn report(&mut self, err: anyhow::Error) {
        warn!(error = format!("{err:#}"), "apply failure");
        self.errs.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errs.is_empty()
    }

    pub fn take(&mut self) -> Errors {
        std::mem::take(&mut self.errs)
    }
}

/// One configured apply run. Construct with [`DesiredSetApply::new`], chain
/// the builder setters, then drive it with [`apply`](Self::apply),
/// [`dry_run`](Self::dry_run) or per-kind [`process`](Self::process).
pub struct DesiredSetApply {
    pub(crate) resolver: Arc<dyn StoreResolver>,
    pub(crate) caches: HashMap<GroupVersionKind, Arc<dyn ObjectCache>>,
    pub(crate) patchers: HashMap<GroupVersionKind, Arc<dyn Patcher>>,
    pub(crate) reconcilers: HashMap<GroupVersionKind, Arc<dyn Reconciler>>,
    pub(crate) owner: Option<Owner>,
    pub(crate) set_owner_reference: bool,
    pub(crate) owner_reference_controller: bool,
    pub(crate) owner_reference_block: bool,
    pub(crate) default_namespace: String,
    pub(crate) lister_namespace: Option<String>,
    pub(crate) restrict_cluster_scoped: bool,
    pub(crate) strict_caching: bool,
    pub(crate) plan_mode: bool,
    pub(crate) objs: ObjectSet,
    pub(crate) plan: Plan,
    pub(crate) errs: ErrorSink,
}

impl DesiredSetApply {
    pub fn new(resolver: Arc<dyn StoreResolver>) -> Self {
        Self {
            resolver,
            caches: HashMap::new(),
            patchers: HashMap::new(),
            reconcilers: HashMap::new(),
            owner: None,
            set_owner_reference: true,
            owner_reference_controller: false,
            owner_reference_block: false,
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            lister_namespace: None,
            restrict_cluster_scoped: false,
            strict_caching: false,
            plan_mode: false,
            objs: ObjectSet::new(),
            plan: Plan::default(),
            errs: ErrorSink::default(),
        }
    }

    /// Bind the run to an owner. Deletion of stale objects requires one.
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Control owner-reference stamping and the flags written onto new
    /// references. Stamping is on by default once an owner is set.
    pub fn with_owner_reference(mut self, set: bool, controller: bool, block: bool) -> Self {
        self.set_owner_reference = set;
        self.owner_reference_controller = controller;
        self.owner_reference_block = block;
        self
    }

    /// Namespace stamped onto namespaced objects that carry none.
    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    /// Restrict listing of existing state to one namespace.
    pub fn with_lister_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.lister_namespace = Some(namespace.into());
        self
    }

    /// Fail a kind's reconciliation when no cache is available instead of
    /// falling back to remote listing.
    pub fn with_strict_caching(mut self, strict: bool) -> Self {
        self.strict_caching = strict;
        self
    }

    /// Reject cluster-scoped kinds outright.
    pub fn with_restrict_cluster_scoped(mut self, restrict: bool) -> Self {
        self.restrict_cluster_scoped = restrict;
        self
    }

    /// Serve listing for `gvk` from a local cache. Kinds registered here are
    /// also visited on every run so their stale objects get pruned even when
    /// the desired set no longer mentions the kind.
    pub fn with_cache(mut self, gvk: GroupVersionKind, cache: Arc<dyn ObjectCache>) -> Self {
        self.caches.insert(gvk, cache);
        self
    }

    /// Override the patcher used for `gvk` updates.
    pub fn with_patcher(mut self, gvk: GroupVersionKind, patcher: Arc<dyn Patcher>) -> Self {
        self.patchers.insert(gvk, patcher);
        self
    }

    /// Attach a reconciler consulted before patching `gvk` objects.
    pub fn with_reconciler(mut self, gvk: GroupVersionKind, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.insert(gvk, reconciler);
        self
    }

    /// Converge the store to `set`, kind by kind, in deterministic order.
    /// Failures are accumulated; the aggregate is returned once every object
    /// has been attempted.
    pub async fn apply(
        &mut self,
        debug_id: &str,
        selector: &Selector,
        set: &ObjectSet,
    ) -> Result<(), Errors> {
        self.objs = set.clone();
        let mut gvks = self.objs.gvks();
        gvks.extend(self.caches.keys().cloned());
        gvks.sort_by_key(gvk_key);
        gvks.dedup();
        for gvk in gvks {
            let objs = self.objs.get(&gvk).cloned().unwrap_or_default();
            self.process(debug_id, selector, &gvk, objs).await;
        }
        self.errs.take().into_result(())
    }

    /// Like [`apply`](Self::apply), but record every intended mutation into a
    /// [`Plan`] instead of touching the store.
    pub async fn dry_run(
        &mut self,
        debug_id: &str,
        selector: &Selector,
        set: &ObjectSet,
    ) -> Result<Plan, Errors> {
        self.plan = Plan::default();
        self.plan_mode = true;
        let res = self.apply(debug_id, selector, set).await;
        self.plan_mode = false;
        let plan = std::mem::take(&mut self.plan);
        res.map(|()| plan)
    }
}
