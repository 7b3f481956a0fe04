#![forbid(unsafe_code)]

use podwatch_core::{PodObject, ResourceKey, ResourceVersion};
use podwatch_store::{LocalStore, Upsert};

fn pod(ns: &str, name: &str, rv: u64, ip: &str) -> PodObject {
    PodObject {
        key: ResourceKey::new(ns, name),
        uid: format!("uid-{}", name),
        version: ResourceVersion(rv),
        ip: ip.to_string(),
        phase: "Running".into(),
        node: Some("node-1".into()),
    }
}

#[test]
fn replay_basic_sequence() {
    let mut store = LocalStore::new();
    let reader = store.reader();

    assert_eq!(store.upsert(pod("ns", "a", 1, "")), Upsert::Inserted);
    // duplicate delivery of the same version is a no-op
    assert_eq!(store.upsert(pod("ns", "a", 1, "")), Upsert::Unchanged);
    assert_eq!(store.upsert(pod("", "b", 2, "")), Upsert::Inserted);
    let e1 = store.publish();
    assert_eq!(e1, 1);
    assert_eq!(reader.len(), 2);

    match store.upsert(pod("ns", "a", 3, "10.0.0.1")) {
        Upsert::Replaced(old) => assert_eq!(old.version, ResourceVersion(1)),
        other => panic!("unexpected {:?}", other),
    }
    let gone = store.delete(&ResourceKey::new("", "b")).unwrap();
    assert_eq!(gone.version, ResourceVersion(2));
    assert!(store.delete(&ResourceKey::new("", "b")).is_none());

    // readers see the old snapshot until publish
    assert_eq!(reader.len(), 2);
    assert_eq!(store.publish(), 2);
    let snap = reader.current();
    assert_eq!(snap.epoch, 2);
    assert_eq!(snap.len(), 1);
    assert_eq!(reader.get(&ResourceKey::new("ns", "a")).unwrap().ip, "10.0.0.1");
}

#[test]
fn stale_versions_never_overwrite() {
    let mut store = LocalStore::new();
    store.upsert(pod("ns", "a", 5, "10.0.0.5"));
    assert_eq!(store.upsert(pod("ns", "a", 4, "10.0.0.4")), Upsert::Stale { stored: ResourceVersion(5) });
    assert_eq!(store.get(&ResourceKey::new("ns", "a")).unwrap().ip, "10.0.0.5");
}

#[test]
fn same_version_with_new_content_replaces() {
    let mut store = LocalStore::new();
    store.upsert(pod("ns", "a", 5, ""));
    assert!(matches!(store.upsert(pod("ns", "a", 5, "10.1.1.1")), Upsert::Replaced(_)));
}

#[test]
fn publish_without_changes_keeps_epoch() {
    let mut store = LocalStore::new();
    let mut rx = store.reader().subscribe_epoch();
    assert_eq!(store.publish(), 1);
    assert!(rx.has_changed().unwrap());
    rx.borrow_and_update();
    assert_eq!(store.publish(), 1);
    assert!(!rx.has_changed().unwrap());
}

#[test]
fn snapshot_is_ordered_by_key() {
    let mut store = LocalStore::new();
    store.upsert(pod("b", "x", 1, ""));
    store.upsert(pod("a", "z", 2, ""));
    store.upsert(pod("a", "y", 3, ""));
    let reader = store.reader();
    assert!(reader.snapshot().is_empty());
    store.publish();
    let keys: Vec<String> = reader.snapshot().into_iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(keys, vec!["a/y", "a/z", "b/x"]);
}
