//! opkit kubehub – store clients behind the `ObjectReader`/`ObjectWriter` contract

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use kube::{
    api::{Api, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use opkit_core::{Object, ObjectKey, ObjectReader, ObjectWriter, StoreError};

pub mod memory;

pub use memory::{Fault, MemoryStore, OpCounts, StoreOp};

/// Build a client from kubeconfig or the in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Store client backed by a live API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    pub fn client(&self) -> &Client { &self.client }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

/// Translate API status codes into the contract's distinguishable conditions.
fn map_kube_err(err: kube::Error, kind: &str, key: &ObjectKey) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => {
            StoreError::NotFound { kind: kind.to_string(), key: key.clone() }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind: kind.to_string(),
            key: key.clone(),
            message: ae.message,
        },
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl ObjectReader for KubeStore {
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<K, StoreError> {
        self.api::<K>(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_kube_err(e, &K::kind(&()), key))
    }

    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<DynamicObject, StoreError> {
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), &key.namespace, &ar),
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        };
        debug!(gvk = ?gvk, key = %key, plural = %ar.plural, "generic fetch");
        api.get(&key.name).await.map_err(|e| map_kube_err(e, &gvk.kind, key))
    }
}

#[async_trait]
impl ObjectWriter for KubeStore {
    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = obj.key();
        self.api::<K>(&key.namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err(e, &K::kind(&()), &key))
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = obj.key();
        self.api::<K>(&key.namespace)
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err(e, &K::kind(&()), &key))
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = obj.key();
        // full PUT on /status; the body's resourceVersion makes it conditional
        let body = serde_json::to_vec(obj)?;
        self.api::<K>(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| map_kube_err(e, &K::kind(&()), &key))
    }
}
