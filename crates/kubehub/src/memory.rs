//! In-process store with the same observable contract as the API server:
//! version tokens, a status sub-resource, and distinguishable not-found and
//! conflict conditions. Counts every call so tests can assert on round trips.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use opkit_core::{Object, ObjectKey, ObjectReader, ObjectWriter, StoreError};
use serde_json::Value as Json;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    UpdateStatus,
}

/// Failure to inject into a store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Unavailable(String),
    Conflict,
    NotFound,
}

/// Calls observed per operation (generic fetches count as gets).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub gets: usize,
    pub creates: usize,
    pub updates: usize,
    pub status_updates: usize,
}

impl OpCounts {
    pub fn writes(&self) -> usize {
        self.creates + self.updates + self.status_updates
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct StoreKey {
    api_version: String,
    kind: String,
    key: ObjectKey,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<StoreKey, Json>,
    next_rv: u64,
    counts: OpCounts,
    read_lag: bool,
    hidden: BTreeSet<StoreKey>,
    injected: HashMap<StoreOp, (usize, Fault)>,
}

impl Inner {
    fn record(&mut self, op: StoreOp, sk: &StoreKey) -> Result<(), StoreError> {
        match op {
            StoreOp::Get => self.counts.gets += 1,
            StoreOp::Create => self.counts.creates += 1,
            StoreOp::Update => self.counts.updates += 1,
            StoreOp::UpdateStatus => self.counts.status_updates += 1,
        }
        let fault = match self.injected.get_mut(&op) {
            Some((skip, _)) if *skip > 0 => {
                *skip -= 1;
                None
            }
            Some(_) => self.injected.remove(&op).map(|(_, fault)| fault),
            None => None,
        };
        match fault {
            Some(Fault::Unavailable(message)) => Err(StoreError::Unavailable(message)),
            Some(Fault::Conflict) => Err(StoreError::Conflict {
                kind: sk.kind.clone(),
                key: sk.key.clone(),
                message: "the object has been modified".into(),
            }),
            Some(Fault::NotFound) => Err(not_found(sk)),
            None => Ok(()),
        }
    }

    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn lookup(&mut self, sk: &StoreKey) -> Result<Json, StoreError> {
        if self.hidden.remove(sk) {
            trace!(key = %sk.key, "write not yet visible");
            return Err(not_found(sk));
        }
        self.objects.get(sk).cloned().ok_or_else(|| not_found(sk))
    }

    fn check_version(&self, sk: &StoreKey, incoming: &Json) -> Result<Json, StoreError> {
        let stored = self.objects.get(sk).cloned().ok_or_else(|| not_found(sk))?;
        let incoming_rv = incoming.pointer("/metadata/resourceVersion").and_then(Json::as_str);
        let stored_rv = stored.pointer("/metadata/resourceVersion").and_then(Json::as_str);
        match incoming_rv {
            Some(rv) if Some(rv) != stored_rv => Err(StoreError::Conflict {
                kind: sk.kind.clone(),
                key: sk.key.clone(),
                message: format!(
                    "the object has been modified (resourceVersion {} != {})",
                    rv,
                    stored_rv.unwrap_or("")
                ),
            }),
            _ => Ok(stored),
        }
    }

    fn store(&mut self, sk: StoreKey, v: Json) {
        if self.read_lag {
            self.hidden.insert(sk.clone());
        }
        self.objects.insert(sk, v);
    }
}

fn not_found(sk: &StoreKey) -> StoreError {
    StoreError::NotFound { kind: sk.kind.clone(), key: sk.key.clone() }
}

fn typed_key<K: Object>(key: &ObjectKey) -> StoreKey {
    StoreKey {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        key: key.clone(),
    }
}

fn set_meta(v: &mut Json, field: &str, value: Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.insert(field.to_string(), value);
    }
}

/// In-memory fake of the store client contract.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Seed an object without counting the write.
    pub fn insert<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let v = serde_json::to_value(obj)?;
        let sk = typed_key::<K>(&obj.key());
        let v = self.seed(sk, v)?;
        Ok(serde_json::from_value(v)?)
    }

    /// Seed an object of a kind that has no Rust type in the caller.
    pub fn insert_dynamic(&self, obj: &DynamicObject) -> Result<(), StoreError> {
        let types = obj.types.clone().unwrap_or_default();
        let sk = StoreKey {
            api_version: types.api_version,
            kind: types.kind,
            key: ObjectKey::new(
                obj.metadata.namespace.clone().unwrap_or_default(),
                obj.metadata.name.clone().unwrap_or_default(),
            ),
        };
        self.seed(sk, serde_json::to_value(obj)?)?;
        Ok(())
    }

    fn seed(&self, sk: StoreKey, mut v: Json) -> Result<Json, StoreError> {
        let mut inner = self.lock()?;
        let rv = inner.bump();
        set_meta(&mut v, "resourceVersion", Json::String(rv));
        inner.objects.insert(sk, v.clone());
        Ok(v)
    }

    /// Current stored copy, bypassing counters, lag and injected failures.
    pub fn peek<K: Object>(&self, key: &ObjectKey) -> Option<K> {
        let inner = self.lock().ok()?;
        let v = inner.objects.get(&typed_key::<K>(key))?.clone();
        serde_json::from_value(v).ok()
    }

    /// Overwrite the stored copy out of band, bumping its resourceVersion,
    /// as a concurrent writer would.
    pub fn tamper<K: Object>(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let sk = typed_key::<K>(key);
        let stored = inner.objects.get(&sk).cloned().ok_or_else(|| not_found(&sk))?;
        let mut obj: K = serde_json::from_value(stored)?;
        f(&mut obj);
        let mut v = serde_json::to_value(&obj)?;
        let rv = inner.bump();
        set_meta(&mut v, "resourceVersion", Json::String(rv));
        inner.objects.insert(sk, v);
        Ok(())
    }

    pub fn counts(&self) -> OpCounts {
        self.lock().map(|i| i.counts).unwrap_or_default()
    }

    pub fn reset_counts(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.counts = OpCounts::default();
        }
    }

    /// Fail the next call of `op` with `StoreError::Unavailable`.
    pub fn fail_next(&self, op: StoreOp, message: &str) {
        self.inject(op, 0, Fault::Unavailable(message.to_string()));
    }

    /// Let `skip` calls of `op` through, then fail the following one with `fault`.
    pub fn inject(&self, op: StoreOp, skip: usize, fault: Fault) {
        if let Ok(mut inner) = self.lock() {
            inner.injected.insert(op, (skip, fault));
        }
    }

    /// When on, every write stays invisible to the next read of that key.
    pub fn set_read_lag(&self, on: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.read_lag = on;
        }
    }
}

#[async_trait]
impl ObjectReader for MemoryStore {
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let mut inner = self.lock()?;
        let sk = typed_key::<K>(key);
        inner.record(StoreOp::Get, &sk)?;
        let v = inner.lookup(&sk)?;
        Ok(serde_json::from_value(v)?)
    }

    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock()?;
        let sk = StoreKey { api_version: gvk.api_version(), kind: gvk.kind.clone(), key: key.clone() };
        inner.record(StoreOp::Get, &sk)?;
        let v = inner.lookup(&sk)?;
        Ok(serde_json::from_value(v)?)
    }
}

#[async_trait]
impl ObjectWriter for MemoryStore {
    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let mut inner = self.lock()?;
        let sk = typed_key::<K>(&obj.key());
        inner.record(StoreOp::Create, &sk)?;
        if inner.objects.contains_key(&sk) {
            return Err(StoreError::Conflict {
                kind: sk.kind.clone(),
                key: sk.key.clone(),
                message: "already exists".into(),
            });
        }
        let mut v = serde_json::to_value(obj)?;
        if let Some(root) = v.as_object_mut() {
            // status is only writable through the sub-resource
            root.remove("status");
            root.insert("apiVersion".into(), Json::String(sk.api_version.clone()));
            root.insert("kind".into(), Json::String(sk.kind.clone()));
        }
        let rv = inner.bump();
        set_meta(&mut v, "resourceVersion", Json::String(rv.clone()));
        set_meta(&mut v, "uid", Json::String(format!("00000000-0000-0000-0000-{:0>12}", rv)));
        set_meta(&mut v, "generation", Json::from(1));
        inner.store(sk, v.clone());
        Ok(serde_json::from_value(v)?)
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let mut inner = self.lock()?;
        let sk = typed_key::<K>(&obj.key());
        inner.record(StoreOp::Update, &sk)?;
        let mut v = serde_json::to_value(obj)?;
        let stored = inner.check_version(&sk, &v)?;
        if let Some(root) = v.as_object_mut() {
            match stored.get("status") {
                Some(status) => root.insert("status".into(), status.clone()),
                None => root.remove("status"),
            };
        }
        for field in ["uid", "creationTimestamp"] {
            if let Some(val) = stored.pointer(&format!("/metadata/{}", field)) {
                set_meta(&mut v, field, val.clone());
            }
        }
        let generation = stored.pointer("/metadata/generation").and_then(Json::as_i64).unwrap_or(1);
        let spec_changed = stored.get("spec") != v.get("spec");
        set_meta(&mut v, "generation", Json::from(if spec_changed { generation + 1 } else { generation }));
        let rv = inner.bump();
        set_meta(&mut v, "resourceVersion", Json::String(rv));
        inner.store(sk, v.clone());
        Ok(serde_json::from_value(v)?)
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let mut inner = self.lock()?;
        let sk = typed_key::<K>(&obj.key());
        inner.record(StoreOp::UpdateStatus, &sk)?;
        let incoming = serde_json::to_value(obj)?;
        let mut v = inner.check_version(&sk, &incoming)?;
        if let Some(root) = v.as_object_mut() {
            match incoming.get("status") {
                Some(status) => root.insert("status".into(), status.clone()),
                None => root.remove("status"),
            };
        }
        let rv = inner.bump();
        set_meta(&mut v, "resourceVersion", Json::String(rv));
        inner.store(sk, v.clone());
        Ok(serde_json::from_value(v)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta { name: Some(name.into()), namespace: Some("default".into()), ..Default::default() }
    }

    #[tokio::test]
    async fn create_get_update_cycle_bumps_versions() {
        let store = MemoryStore::new();
        let key = ObjectKey::new("default", "cm");
        assert!(store.get::<ConfigMap>(&key).await.unwrap_err().is_not_found());

        let created = store.create(&ConfigMap { metadata: meta("cm"), ..Default::default() }).await.unwrap();
        let rv1 = created.metadata.resource_version.clone().unwrap();
        assert!(created.metadata.uid.is_some());

        let mut live: ConfigMap = store.get(&key).await.unwrap();
        live.data = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        let updated = store.update(&live).await.unwrap();
        assert_ne!(updated.metadata.resource_version.unwrap(), rv1);

        let counts = store.counts();
        assert_eq!(counts, OpCounts { gets: 2, creates: 1, updates: 1, status_updates: 0 });
        assert_eq!(counts.writes(), 2);
    }

    #[tokio::test]
    async fn stale_version_and_duplicate_create_conflict() {
        let store = MemoryStore::new();
        let key = ObjectKey::new("default", "cm");
        let first = store.create(&ConfigMap { metadata: meta("cm"), ..Default::default() }).await.unwrap();
        assert!(store.create(&first).await.unwrap_err().is_conflict());

        store.tamper::<ConfigMap>(&key, |cm| cm.data = Some(BTreeMap::new())).unwrap();
        assert!(store.update(&first).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn status_is_only_written_through_subresource() {
        let store = MemoryStore::new();
        let key = ObjectKey::new("default", "web");
        let mut dep = Deployment {
            metadata: meta("web"),
            spec: Some(DeploymentSpec { replicas: Some(1), ..Default::default() }),
            status: Some(DeploymentStatus { replicas: Some(9), ..Default::default() }),
        };
        let created = store.create(&dep).await.unwrap();
        assert!(created.status.is_none());

        dep = created;
        dep.status = Some(DeploymentStatus { ready_replicas: Some(1), ..Default::default() });
        let after_update = store.update(&dep).await.unwrap();
        assert!(after_update.status.is_none());

        let after_status = store.update_status(&dep).await;
        // the plain update above moved the version on
        assert!(after_status.unwrap_err().is_conflict());

        let mut fresh: Deployment = store.get(&key).await.unwrap();
        fresh.status = Some(DeploymentStatus { ready_replicas: Some(1), ..Default::default() });
        fresh.spec = Some(DeploymentSpec { replicas: Some(5), ..Default::default() });
        let written = store.update_status(&fresh).await.unwrap();
        assert_eq!(written.status.and_then(|s| s.ready_replicas), Some(1));
        assert_eq!(written.spec.and_then(|s| s.replicas), Some(1));
    }

    #[tokio::test]
    async fn read_lag_hides_one_read_and_injection_fails_once() {
        let store = MemoryStore::new();
        let key = ObjectKey::new("default", "cm");
        store.set_read_lag(true);
        store.create(&ConfigMap { metadata: meta("cm"), ..Default::default() }).await.unwrap();
        assert!(store.get::<ConfigMap>(&key).await.unwrap_err().is_not_found());
        assert!(store.get::<ConfigMap>(&key).await.is_ok());

        store.fail_next(StoreOp::Get, "boom");
        let err = store.get::<ConfigMap>(&key).await.unwrap_err();
        assert_eq!(err.to_string(), "store unavailable: boom");
        assert!(store.get::<ConfigMap>(&key).await.is_ok());
    }

    #[tokio::test]
    async fn dynamic_fetch_sees_typed_and_seeded_objects() {
        let store = MemoryStore::new();
        store.insert(&ConfigMap { metadata: meta("cm"), ..Default::default() }).unwrap();
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let obj = store.get_dynamic(&gvk, &ObjectKey::new("default", "cm")).await.unwrap();
        assert_eq!(obj.types.map(|t| t.kind), Some("ConfigMap".to_string()));

        let widget_gvk = GroupVersionKind::gvk("example.com", "v1", "Widget");
        let missing = store.get_dynamic(&widget_gvk, &ObjectKey::new("default", "w")).await;
        assert!(missing.unwrap_err().is_not_found());
    }
}
