#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::json;

use applyset_clients::mem::{make_object, MemoryResolver, MemoryStore, Mutation, StaticCache};
use applyset_core::{ObjectKey, ObjectSet, Owner, Selector};
use applyset_engine::{replace_on_change, DesiredSetApply, Reconciler};

fn cm_gvk() -> GroupVersionKind {
    GroupVersionKind { group: String::new(), version: "v1".into(), kind: "ConfigMap".into() }
}

fn cm(ns: &str, name: &str, value: &str) -> DynamicObject {
    make_object("v1", "ConfigMap", Some(ns), name, json!({"data": {"value": value}}))
}

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

fn single_kind(store: Arc<MemoryStore>, namespaced: bool) -> Arc<MemoryResolver> {
    let mut resolver = MemoryResolver::new();
    resolver.register(cm_gvk(), namespaced, store);
    Arc::new(resolver)
}

#[tokio::test]
async fn converges_create_update_delete() {
    let store = Arc::new(MemoryStore::new());
    store.seed(cm("ns1", "b", "old")).unwrap();
    store.seed(cm("ns1", "c", "stale")).unwrap();
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true)).with_owner(owner());

    let mut set = ObjectSet::new();
    set.add_object(cm("ns1", "a", "fresh")).unwrap();
    set.add_object(cm("ns1", "b", "new")).unwrap();

    engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap();

    assert!(store.contains(&ObjectKey::namespaced("ns1", "a")));
    let b = store.get_object(&ObjectKey::namespaced("ns1", "b")).unwrap();
    assert_eq!(b.data["data"]["value"], "new");
    assert!(!store.contains(&ObjectKey::namespaced("ns1", "c")));
    assert_eq!(
        store.mutations(),
        vec![
            Mutation::Create(ObjectKey::namespaced("ns1", "a")),
            Mutation::Patch(ObjectKey::namespaced("ns1", "b")),
            Mutation::Delete { key: ObjectKey::namespaced("ns1", "c"), force: false },
        ]
    );
}

#[tokio::test]
async fn owner_reference_is_stamped_on_created_objects() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true))
        .with_owner(owner())
        .with_owner_reference(true, true, false);

    let mut set = ObjectSet::new();
    set.add_object(cm("ns1", "a", "fresh")).unwrap();
    engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap();

    let a = store.get_object(&ObjectKey::namespaced("ns1", "a")).unwrap();
    let refs = a.metadata.owner_references.unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].uid, "uid-1");
    assert_eq!(refs[0].controller, Some(true));
}

#[tokio::test]
async fn unchanged_objects_are_left_alone() {
    let store = Arc::new(MemoryStore::new());
    store.seed(cm("ns1", "b", "same")).unwrap();
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true));

    let mut set = ObjectSet::new();
    set.add_object(cm("ns1", "b", "same")).unwrap();
    engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap();

    assert!(store.mutations().is_empty());
}

#[tokio::test]
async fn create_conflict_turns_into_takeover_update() {
    let store = Arc::new(MemoryStore::new());
    store.seed(cm("ns1", "a", "unmanaged")).unwrap();
    // Empty cache: the engine believes nothing exists yet.
    let mut resolver = MemoryResolver::new();
    resolver.register_with_cache(cm_gvk(), true, store.clone(), Arc::new(StaticCache::empty()));
    let mut engine = DesiredSetApply::new(Arc::new(resolver));

    let mut set = ObjectSet::new();
    set.add_object(cm("ns1", "a", "managed")).unwrap();
    engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap();

    let a = store.get_object(&ObjectKey::namespaced("ns1", "a")).unwrap();
    assert_eq!(a.data["data"]["value"], "managed");
    assert_eq!(store.mutations(), vec![Mutation::Patch(ObjectKey::namespaced("ns1", "a"))]);
}

#[tokio::test]
async fn replace_request_force_deletes_and_reports_transient_wait() {
    let store = Arc::new(MemoryStore::new());
    store.seed(cm("ns1", "b", "old")).unwrap();
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true))
        .with_owner(owner())
        .with_patcher(cm_gvk(), replace_on_change());

    let mut set = ObjectSet::new();
    set.add_object(cm("ns1", "b", "new")).unwrap();
    let err = engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap_err();

    assert!(err.to_string().contains("waiting for replace of ns1/b"), "err={err}");
    assert!(!store.contains(&ObjectKey::namespaced("ns1", "b")));
    assert_eq!(
        store.mutations(),
        vec![Mutation::Delete { key: ObjectKey::namespaced("ns1", "b"), force: true }]
    );
}

#[tokio::test]
async fn ownerless_runs_never_delete() {
    let store = Arc::new(MemoryStore::new());
    store.seed(cm("ns1", "c", "stale")).unwrap();
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true));

    let mut set = ObjectSet::new();
    set.add_object(cm("ns1", "a", "fresh")).unwrap();
    engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap();

    assert!(store.contains(&ObjectKey::namespaced("ns1", "c")));
    assert_eq!(store.mutations(), vec![Mutation::Create(ObjectKey::namespaced("ns1", "a"))]);
}

#[tokio::test]
async fn partial_listing_failure_keeps_other_namespaces_working() {
    let store = Arc::new(MemoryStore::new());
    store.seed(cm("ns1", "b", "old")).unwrap();
    store.fail_lists_in("ns2");
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true));

    let mut set = ObjectSet::new();
    set.add_object(cm("ns1", "b", "new")).unwrap();
    set.add_object(cm("ns2", "x", "fresh")).unwrap();
    let err = engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap_err();

    assert!(err.to_string().contains("ns2"), "err={err}");
    // ns1's listing was still merged and used.
    let b = store.get_object(&ObjectKey::namespaced("ns1", "b")).unwrap();
    assert_eq!(b.data["data"]["value"], "new");
    assert!(store.contains(&ObjectKey::namespaced("ns2", "x")));
}

#[tokio::test]
async fn selector_scopes_existing_state() {
    let store = Arc::new(MemoryStore::new());
    store.seed(cm("ns1", "unrelated", "keep")).unwrap();
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true)).with_owner(owner());

    let mut labeled = cm("ns1", "b", "v1");
    labeled.metadata.labels =
        Some([("app".to_string(), "demo".to_string())].into_iter().collect());
    let mut set = ObjectSet::new();
    set.add_object(labeled).unwrap();

    let selector = Selector::new().matching("app", "demo");
    engine.apply("deploy/demo", &selector, &set).await.unwrap();

    // The unlabeled object is outside the selector's view: never a delete
    // candidate.
    assert!(store.contains(&ObjectKey::namespaced("ns1", "unrelated")));
    assert_eq!(store.mutations(), vec![Mutation::Create(ObjectKey::namespaced("ns1", "b"))]);
}

#[tokio::test]
async fn deleting_an_already_gone_object_is_not_an_error() {
    let store = Arc::new(MemoryStore::new());
    // The cache still reports an object the store no longer holds.
    let cache = Arc::new(StaticCache::new(vec![cm("ns1", "ghost", "gone")]));
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true))
        .with_owner(owner())
        .with_cache(cm_gvk(), cache);

    engine.apply("deploy/demo", &Selector::new(), &ObjectSet::new()).await.unwrap();

    assert!(store.mutations().is_empty());
}

struct RecordingReconciler {
    calls: std::sync::Mutex<Vec<(String, bool)>>,
}

#[async_trait::async_trait]
impl Reconciler for RecordingReconciler {
    async fn reconcile(
        &self,
        existing: &DynamicObject,
        _desired: &DynamicObject,
        batch_active: bool,
    ) -> anyhow::Result<bool> {
        let name = existing.metadata.name.clone().unwrap_or_default();
        self.calls.lock().unwrap().push((name, batch_active));
        Ok(true)
    }
}

#[tokio::test]
async fn registered_reconciler_preempts_patching() {
    let store = Arc::new(MemoryStore::new());
    store.seed(cm("ns1", "b", "old")).unwrap();
    let reconciler = Arc::new(RecordingReconciler { calls: std::sync::Mutex::new(Vec::new()) });
    let mut engine = DesiredSetApply::new(single_kind(store.clone(), true))
        .with_owner(owner())
        .with_reconciler(cm_gvk(), reconciler.clone());

    let mut set = ObjectSet::new();
    set.add_object(cm("ns1", "a", "fresh")).unwrap();
    set.add_object(cm("ns1", "b", "new")).unwrap();
    engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap();

    // The hook handled "b"; no patch was issued and the object is untouched.
    assert_eq!(store.mutations(), vec![Mutation::Create(ObjectKey::namespaced("ns1", "a"))]);
    assert_eq!(
        store.get_object(&ObjectKey::namespaced("ns1", "b")).unwrap().data["data"]["value"],
        "old"
    );
    assert_eq!(*reconciler.calls.lock().unwrap(), vec![("b".to_string(), true)]);
}

#[tokio::test]
async fn cluster_scoped_kind_rejected_when_restricted() {
    let gvk = GroupVersionKind { group: String::new(), version: "v1".into(), kind: "Namespace".into() };
    let store = Arc::new(MemoryStore::new());
    let mut resolver = MemoryResolver::new();
    resolver.register(gvk, false, store.clone());
    let mut engine = DesiredSetApply::new(Arc::new(resolver)).with_restrict_cluster_scoped(true);

    let mut set = ObjectSet::new();
    set.add_object(make_object("v1", "Namespace", None, "system", json!({}))).unwrap();
    let err = engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap_err();

    assert!(err.to_string().contains("invalid cluster scoped gvk"), "err={err}");
    assert!(store.mutations().is_empty());
}

#[tokio::test]
async fn cluster_scoped_objects_are_stripped_of_namespaces() {
    let gvk = GroupVersionKind { group: String::new(), version: "v1".into(), kind: "Namespace".into() };
    let store = Arc::new(MemoryStore::new());
    let mut resolver = MemoryResolver::new();
    resolver.register(gvk, false, store.clone());
    let mut engine = DesiredSetApply::new(Arc::new(resolver));

    let mut set = ObjectSet::new();
    // Caller mistakenly qualified a cluster-scoped object.
    set.add_object(make_object("v1", "Namespace", Some("ns1"), "system", json!({}))).unwrap();
    engine.apply("deploy/demo", &Selector::new(), &set).await.unwrap();

    let stored = store.get_object(&ObjectKey::cluster("system")).unwrap();
    assert!(stored.metadata.namespace.is_none());
    assert!(!store.contains(&ObjectKey::namespaced("ns1", "system")));
}
