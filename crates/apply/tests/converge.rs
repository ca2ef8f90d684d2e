use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use opkit_apply::{
    create_or_update, create_or_update_from_template, create_or_update_from_template_with_outcome,
    Outcome, ReconcileError,
};
use opkit_core::{fingerprint, read_fingerprint, ObjectKey};
use opkit_kubehub::{Fault, MemoryStore, OpCounts, StoreOp};

fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("apps".into()),
            ..Default::default()
        },
        data: Some(data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
        ..Default::default()
    }
}

#[tokio::test]
async fn missing_object_is_created_with_fingerprint() {
    let store = MemoryStore::new();
    let template = config_map("settings", &[("mode", "fast")]);

    let (live, outcome) = create_or_update_from_template_with_outcome(&store, &template).await.unwrap();
    assert_eq!(outcome, Outcome::Created);
    assert_eq!(read_fingerprint(&live), fingerprint(&template).unwrap());
    assert!(live.metadata.resource_version.is_some());
    assert!(live.metadata.uid.is_some());
    assert_eq!(store.counts(), OpCounts { gets: 2, creates: 1, updates: 0, status_updates: 0 });
}

#[tokio::test]
async fn second_convergence_of_same_template_does_not_write() {
    let store = MemoryStore::new();
    let template = config_map("settings", &[("mode", "fast")]);

    let first = create_or_update_from_template(&store, &template).await.unwrap();
    store.reset_counts();

    let (second, outcome) = create_or_update_from_template_with_outcome(&store, &template).await.unwrap();
    assert_eq!(outcome, Outcome::Unchanged);
    assert_eq!(store.counts(), OpCounts { gets: 1, ..Default::default() });
    assert_eq!(read_fingerprint(&first), read_fingerprint(&second));
    assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
}

#[tokio::test]
async fn changed_template_updates_exactly_once() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("apps", "settings");
    create_or_update_from_template(&store, &config_map("settings", &[("mode", "fast")]))
        .await
        .unwrap();
    store.reset_counts();

    let changed = config_map("settings", &[("mode", "safe")]);
    let (live, outcome) = create_or_update_from_template_with_outcome(&store, &changed).await.unwrap();
    assert_eq!(outcome, Outcome::Updated);
    assert_eq!(store.counts().updates, 1);
    assert_eq!(store.counts().writes(), 1);
    assert_eq!(read_fingerprint(&live), fingerprint(&changed).unwrap());

    let stored: ConfigMap = store.peek(&key).unwrap();
    assert_eq!(stored.data.unwrap().get("mode").map(String::as_str), Some("safe"));
}

#[tokio::test]
async fn drift_without_fingerprint_is_overwritten_from_template() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("apps", "settings");
    store.insert(&config_map("settings", &[("mode", "manual")])).unwrap();

    let template = config_map("settings", &[("mode", "fast")]);
    let (live, outcome) = create_or_update_from_template_with_outcome(&store, &template).await.unwrap();
    assert_eq!(outcome, Outcome::Updated);
    assert_eq!(live.data.unwrap().get("mode").map(String::as_str), Some("fast"));
    assert_eq!(read_fingerprint(&store.peek::<ConfigMap>(&key).unwrap()), fingerprint(&template).unwrap());
}

#[tokio::test]
async fn invisible_write_returns_the_write_response() {
    let store = MemoryStore::new();
    store.set_read_lag(true);
    let template = config_map("settings", &[("mode", "fast")]);

    let live = create_or_update_from_template(&store, &template).await.unwrap();
    assert_eq!(read_fingerprint(&live), fingerprint(&template).unwrap());
    assert!(live.metadata.resource_version.is_some());
    assert_eq!(store.counts(), OpCounts { gets: 2, creates: 1, updates: 0, status_updates: 0 });
}

#[tokio::test]
async fn other_refetch_failures_are_surfaced() {
    let store = MemoryStore::new();
    store.inject(StoreOp::Get, 1, Fault::Unavailable("connection reset".into()));

    let err = create_or_update_from_template(&store, &config_map("settings", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Refetch { .. }), "{err}");
    assert!(store.peek::<ConfigMap>(&ObjectKey::new("apps", "settings")).is_some());
}

#[tokio::test]
async fn read_failure_stops_before_any_write() {
    let store = MemoryStore::new();
    store.fail_next(StoreOp::Get, "apiserver down");

    let err = create_or_update_from_template(&store, &config_map("settings", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Get { .. }));
    assert_eq!(err.to_string(), "failed to get ConfigMap apps/settings: store unavailable: apiserver down");
    assert_eq!(store.counts().writes(), 0);
}

#[tokio::test]
async fn write_conflict_is_returned_not_retried() {
    let store = MemoryStore::new();
    store.insert(&config_map("settings", &[("mode", "manual")])).unwrap();
    store.inject(StoreOp::Update, 0, Fault::Conflict);

    let err = create_or_update_from_template(&store, &config_map("settings", &[("mode", "fast")]))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.counts().updates, 1);
    assert_eq!(store.counts().gets, 1);
}

#[tokio::test]
async fn mutate_initializes_missing_object_under_key() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("apps", "generated");

    let live = create_or_update(&store, &key, ConfigMap::default(), |cm| {
        cm.data = Some(BTreeMap::from([("seed".to_string(), "1".to_string())]));
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(live.metadata.name.as_deref(), Some("generated"));
    assert_eq!(live.metadata.namespace.as_deref(), Some("apps"));
    assert_eq!(live.data.unwrap().get("seed").map(String::as_str), Some("1"));
    assert_eq!(store.counts().creates, 1);
}

#[tokio::test]
async fn mutate_edits_existing_object_in_place() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("apps", "settings");
    store.insert(&config_map("settings", &[("mode", "fast")])).unwrap();

    let live = create_or_update(&store, &key, ConfigMap::default(), |cm| {
        cm.data.get_or_insert_with(BTreeMap::new).insert("extra".into(), "yes".into());
        Ok(())
    })
    .await
    .unwrap();
    let data = live.data.unwrap();
    assert_eq!(data.get("mode").map(String::as_str), Some("fast"));
    assert_eq!(data.get("extra").map(String::as_str), Some("yes"));
    assert_eq!(store.counts(), OpCounts { gets: 2, creates: 0, updates: 1, status_updates: 0 });
}

#[tokio::test]
async fn mutate_failure_skips_the_write() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("apps", "settings");

    let err = create_or_update(&store, &key, ConfigMap::default(), |_| {
        Err(anyhow::anyhow!("missing input"))
    })
    .await
    .unwrap_err();
    assert!(matches!(err, ReconcileError::Mutate { .. }));
    assert_eq!(err.to_string(), "failed to mutate ConfigMap apps/settings: missing input");
    assert_eq!(store.counts().writes(), 0);
}

#[tokio::test]
async fn invisible_update_returns_the_write_response() {
    let store = MemoryStore::new();
    store.insert(&config_map("settings", &[("mode", "manual")])).unwrap();
    store.set_read_lag(true);

    let template = config_map("settings", &[("mode", "fast")]);
    let (live, outcome) = create_or_update_from_template_with_outcome(&store, &template).await.unwrap();
    assert_eq!(outcome, Outcome::Updated);
    assert_eq!(read_fingerprint(&live), fingerprint(&template).unwrap());
    assert_eq!(live.data.unwrap().get("mode").map(String::as_str), Some("fast"));
    assert_eq!(store.counts(), OpCounts { gets: 2, creates: 0, updates: 1, status_updates: 0 });
}

#[tokio::test]
async fn invisible_mutate_write_returns_the_write_response() {
    let store = MemoryStore::new();
    store.set_read_lag(true);
    let key = ObjectKey::new("apps", "generated");

    let live = create_or_update(&store, &key, ConfigMap::default(), |cm| {
        cm.data = Some(BTreeMap::from([("seed".to_string(), "1".to_string())]));
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(live.metadata.name.as_deref(), Some("generated"));
    assert!(live.metadata.resource_version.is_some());
    assert_eq!(store.counts(), OpCounts { gets: 2, creates: 1, updates: 0, status_updates: 0 });
}
