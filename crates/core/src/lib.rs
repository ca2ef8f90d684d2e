//! opkit core: the capability set every reconciled resource exposes, the store
//! client contract, content fingerprints and the retry signal.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::Resource;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod generate;
pub mod hash;

pub use generate::{generate_name, generate_password, GenerateError};
pub use hash::{fingerprint, read_fingerprint, write_fingerprint, ANNOTATION_KEY};

pub mod prelude {
    pub use super::{
        retryable, Object, ObjectKey, ObjectReader, ObjectWriter, Retry, Retryable, StoreError,
    };
}

/// Compound key of a namespaced resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Capability set of a resource the reconciler and resolver can work with:
/// key access, annotation access and content cloning (`Clone`).
///
/// Blanket-implemented for every namespaced kube resource with a static type,
/// which covers the `k8s-openapi` kinds and derived custom resources.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
    /// Group/version/kind identity of the concrete type.
    fn type_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(&Self::group(&()), &Self::version(&()), &Self::kind(&()))
    }

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    fn stamp_key(&mut self, key: &ObjectKey) {
        let meta = self.meta_mut();
        meta.name = Some(key.name.clone());
        meta.namespace = Some(key.namespace.clone());
    }

    fn annotations_map(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().annotations.as_ref()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations_map().and_then(|a| a.get(key)).map(String::as_str)
    }

    fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        self.meta_mut().annotations = Some(annotations);
    }

    /// Upsert a single annotation, creating the map when absent.
    fn set_annotation(&mut self, key: &str, value: String) {
        self.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value);
    }
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static
{
}

/// Errors reported by a store client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },
    #[error("conflict on {kind} {key}: {message}")]
    Conflict { kind: String, key: ObjectKey, message: String },
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Read half of the store client contract.
#[async_trait]
pub trait ObjectReader: Send + Sync {
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<K, StoreError>;

    /// Fetch any kind in generic form, including kinds the caller has no Rust type for.
    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<DynamicObject, StoreError>;
}

/// Write half of the store client contract. Writes are guarded by the
/// object's resourceVersion when one is set.
#[async_trait]
pub trait ObjectWriter: ObjectReader {
    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError>;

    async fn update<K: Object>(&self, obj: &K) -> Result<K, StoreError>;

    /// Write only the status sub-resource.
    async fn update_status<K: Object>(&self, obj: &K) -> Result<K, StoreError>;
}

/// Explicit transient/fatal classification of an error.
pub trait Retry {
    fn is_retryable(&self) -> bool;
}

/// Tags an error as transient. Display and `source()` are those of the wrapped error.
#[derive(Debug)]
pub struct Retryable<E> {
    inner: E,
}

/// Mark an error as retryable.
pub fn retryable<E>(err: E) -> Retryable<E> {
    Retryable { inner: err }
}

impl<E> Retryable<E> {
    pub fn get_ref(&self) -> &E {
        &self.inner
    }

    pub fn into_inner(self) -> E {
        self.inner
    }
}

impl<E: fmt::Display> fmt::Display for Retryable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Retryable<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl<E> Retry for Retryable<E> {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retry for StoreError {
    fn is_retryable(&self) -> bool {
        false
    }
}
