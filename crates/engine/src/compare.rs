//! Comparison/patch step: decides whether an update needs a patch, a full
//! replace, or nothing, and carries the patcher capability variants.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

use applyset_core::{gvk_key, ObjectKey, ObjectStore, PatchKind, PlanUpdate};

/// Metadata fields populated by the server; never part of a patch body or a
/// freshly created object.
const SERVER_METADATA_FIELDS: [&str; 6] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "managedFields",
    "generation",
    "selfLink",
];

/// Result of comparing one existing/desired pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOutcome {
    Unchanged,
    Patched,
    /// The object cannot be patched into shape; delete it and let a later
    /// pass recreate it.
    ReplaceRequired,
}

/// What a [`Patcher`] did with the patch it was handed.
#[derive(Debug)]
pub enum PatchResult {
    Applied(Box<DynamicObject>),
    Recorded,
    Replace,
}

/// Applies (or records) one update. Variants: store-backed, plan-recording,
/// and replace-demanding.
#[async_trait]
pub trait Patcher: Send + Sync {
    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        kind: PatchKind,
        data: Vec<u8>,
    ) -> Result<PatchResult>;
}

/// Per-kind hook consulted before the default patch path. `batch_active`
/// tells the hook whether creates or deletes are also happening in this run.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Return `true` when the update has been fully handled and no patch is
    /// needed.
    async fn reconcile(
        &self,
        existing: &DynamicObject,
        desired: &DynamicObject,
        batch_active: bool,
    ) -> Result<bool>;
}

/// Default patcher: forwards the patch to the store verbs.
pub struct StorePatcher {
    store: Arc<dyn ObjectStore>,
}

impl StorePatcher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Patcher for StorePatcher {
    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        kind: PatchKind,
        data: Vec<u8>,
    ) -> Result<PatchResult> {
        let obj = self.store.patch(namespace, name, kind, data).await?;
        Ok(PatchResult::Applied(Box::new(obj)))
    }
}

struct ReplaceOnChange;

#[async_trait]
impl Patcher for ReplaceOnChange {
    async fn patch(
        &self,
        _namespace: Option<&str>,
        _name: &str,
        _kind: PatchKind,
        _data: Vec<u8>,
    ) -> Result<PatchResult> {
        Ok(PatchResult::Replace)
    }
}

/// Patcher that demands a full replace whenever any change is detected.
pub fn replace_on_change() -> Arc<dyn Patcher> {
    Arc::new(ReplaceOnChange)
}

/// Plan-mode patcher: sanitizes the would-be patch body and records it when
/// it is not a no-op.
pub struct PlanPatcher {
    gvk: String,
    updates: Mutex<Vec<PlanUpdate>>,
}

impl PlanPatcher {
    pub fn new(gvk: impl Into<String>) -> Self {
        Self { gvk: gvk.into(), updates: Mutex::new(Vec::new()) }
    }

    pub fn take(&self) -> Vec<PlanUpdate> {
        std::mem::take(&mut *self.updates.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl Patcher for PlanPatcher {
    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        _kind: PatchKind,
        data: Vec<u8>,
    ) -> Result<PatchResult> {
        let data = sanitize_patch(&data, true)?;
        if data != b"{}" {
            let patch = String::from_utf8(data).context("patch body is not utf-8")?;
            self.updates.lock().unwrap_or_else(|e| e.into_inner()).push(PlanUpdate {
                gvk: self.gvk.clone(),
                namespace: namespace.map(|s| s.to_string()),
                name: name.to_string(),
                patch,
            });
        }
        Ok(PatchResult::Recorded)
    }
}

fn strip_server_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in SERVER_METADATA_FIELDS {
            meta.remove(field);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
}

fn pruned_json(obj: &DynamicObject) -> Result<Json> {
    let mut v = serde_json::to_value(obj).context("serializing object for comparison")?;
    strip_server_fields(&mut v);
    Ok(v)
}

/// RFC 7386 merge patch turning `live` into `desired`. Arrays and scalars
/// replace wholesale; object fields merge recursively; fields absent from
/// `desired` are nulled out.
pub fn merge_patch(live: &Json, desired: &Json) -> Json {
    match (live, desired) {
        (Json::Object(l), Json::Object(d)) => {
            let mut out = serde_json::Map::new();
            for (k, dv) in d {
                match l.get(k) {
                    Some(lv) if lv == dv => {}
                    Some(lv) if lv.is_object() && dv.is_object() => {
                        out.insert(k.clone(), merge_patch(lv, dv));
                    }
                    _ => {
                        out.insert(k.clone(), dv.clone());
                    }
                }
            }
            for k in l.keys() {
                if !d.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            Json::Object(out)
        }
        _ => desired.clone(),
    }
}

/// Strip server-populated fields from a patch body. Plan-mode bodies also
/// drop `apiVersion`/`kind` noise so no-op detection against `{}` works.
pub fn sanitize_patch(data: &[u8], for_plan: bool) -> Result<Vec<u8>> {
    let mut v: Json = serde_json::from_slice(data).context("parsing patch body")?;
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
        if for_plan {
            obj.remove("apiVersion");
            obj.remove("kind");
        }
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in SERVER_METADATA_FIELDS {
                meta.remove(field);
            }
        }
        if obj.get("metadata").and_then(|m| m.as_object()).is_some_and(|m| m.is_empty()) {
            obj.remove("metadata");
        }
    }
    Ok(serde_json::to_vec(&v)?)
}

/// Copy of `obj` fit for a create call: server-populated metadata and status
/// removed.
pub fn prepare_for_create(obj: &DynamicObject) -> DynamicObject {
    let mut out = obj.clone();
    out.metadata.resource_version = None;
    out.metadata.uid = None;
    out.metadata.creation_timestamp = None;
    out.metadata.managed_fields = None;
    out.metadata.generation = None;
    if let Some(map) = out.data.as_object_mut() {
        map.remove("status");
    }
    out
}

/// Compare one existing/desired pair and drive the patcher when they differ.
#[allow(clippy::too_many_arguments)]
pub async fn compare_objects(
    gvk: &GroupVersionKind,
    key: &ObjectKey,
    reconciler: Option<&Arc<dyn Reconciler>>,
    patcher: &Arc<dyn Patcher>,
    debug_id: &str,
    existing: &DynamicObject,
    desired: &DynamicObject,
    batch_active: bool,
) -> Result<CompareOutcome> {
    let live = pruned_json(existing)?;
    let target = pruned_json(desired)?;
    if live == target {
        debug!(gvk = %gvk_key(gvk), key = %key, debug_id, "no change");
        return Ok(CompareOutcome::Unchanged);
    }

    if let Some(rec) = reconciler {
        if rec.reconcile(existing, desired, batch_active).await? {
            counter!("applyset_updates_total", 1u64);
            return Ok(CompareOutcome::Patched);
        }
    }

    let patch = merge_patch(&live, &target);
    let data = sanitize_patch(&serde_json::to_vec(&patch)?, false)?;
    if data == b"{}" {
        return Ok(CompareOutcome::Unchanged);
    }
    debug!(
        gvk = %gvk_key(gvk),
        key = %key,
        debug_id,
        patch = %String::from_utf8_lossy(&data),
        "applying patch"
    );
    match patcher.patch(key.namespace.as_deref(), &key.name, PatchKind::Merge, data).await? {
        PatchResult::Replace => Ok(CompareOutcome::ReplaceRequired),
        PatchResult::Applied(_) | PatchResult::Recorded => {
            counter!("applyset_updates_total", 1u64);
            Ok(CompareOutcome::Patched)
        }
    }
}
