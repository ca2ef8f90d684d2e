//! opkit reference: declarative pointers from one resource to another.
//!
//! A reference is resolved at read time against a store reader. Targets are
//! always fetched in generic form and then decoded through the [`Scheme`];
//! kinds the scheme does not know come back generic instead of failing.
//! A missing target is the only retryable failure.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use opkit_core::{retryable, Object, ObjectKey, ObjectReader, Retry, Retryable, StoreError};
use opkit_schema::{gvk_key, parse_api_version, Scheme, SchemaError, TypedObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Target does not exist (yet). Carries the retry tag.
    #[error(transparent)]
    Missing(Retryable<StoreError>),
    #[error("failed to resolve reference to {kind} {key}: {source}")]
    Fetch { kind: String, key: ObjectKey, source: StoreError },
    #[error("failed to get object kind of parent: {source}")]
    ParentKind { source: SchemaError },
    #[error("failed to decode {kind} {key}: {source}")]
    Decode { kind: String, key: ObjectKey, source: SchemaError },
    #[error("resolved {found}, expected {expected}")]
    UnexpectedType { expected: String, found: String },
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Missing(_))
    }
}

impl Retry for ResolveError {
    fn is_retryable(&self) -> bool {
        ResolveError::is_retryable(self)
    }
}

/// Namespace and apiVersion that unset reference fields default to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentContext {
    pub namespace: String,
    pub api_version: String,
}

impl ParentContext {
    pub fn new(namespace: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), api_version: api_version.into() }
    }

    /// Context of `parent`, taking its apiVersion from the scheme.
    pub fn of<P: Object>(scheme: &Scheme, parent: &P) -> Result<Self, ResolveError> {
        let gvk = scheme.object_kind(parent).map_err(|source| ResolveError::ParentKind { source })?;
        Ok(Self::new(parent.meta().namespace.clone().unwrap_or_default(), gvk.api_version()))
    }
}

/// The object a reference points at.
#[derive(Debug)]
pub enum Resolved {
    /// Decoded into a type registered in the scheme.
    Typed(TypedObject),
    /// Kind unknown to the scheme; generic form as fetched.
    Dynamic(DynamicObject),
}

impl Resolved {
    pub fn is_typed(&self) -> bool {
        matches!(self, Resolved::Typed(_))
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Resolved::Typed(t) => t.meta(),
            Resolved::Dynamic(d) => &d.metadata,
        }
    }

    pub fn gvk(&self) -> Option<GroupVersionKind> {
        match self {
            Resolved::Typed(t) => Some(t.gvk().clone()),
            Resolved::Dynamic(d) => d.types.as_ref().map(|t| {
                let (group, version) = parse_api_version(&t.api_version);
                GroupVersionKind::gvk(&group, &version, &t.kind)
            }),
        }
    }

    /// Recover `K`: a typed result is downcast, a generic one is decoded
    /// directly into `K` when its kind matches.
    pub fn into_object<K: Object>(self) -> Result<K, ResolveError> {
        let expected = gvk_key(&K::type_gvk());
        match self {
            Resolved::Typed(t) => t.downcast::<K>().map_err(|t| ResolveError::UnexpectedType {
                expected,
                found: gvk_key(t.gvk()),
            }),
            Resolved::Dynamic(d) => {
                let found = d.types.clone().unwrap_or_default();
                if found.api_version != K::api_version(&()) || found.kind != K::kind(&()) {
                    return Err(ResolveError::UnexpectedType {
                        expected,
                        found: format!("{}/{}", found.api_version, found.kind),
                    });
                }
                let key = ObjectKey::new(
                    d.metadata.namespace.clone().unwrap_or_default(),
                    d.metadata.name.clone().unwrap_or_default(),
                );
                let kind = found.kind.clone();
                serde_json::to_value(&d)
                    .and_then(serde_json::from_value)
                    .map_err(|source| ResolveError::Decode {
                        kind: kind.clone(),
                        key,
                        source: SchemaError::Decode { kind, source },
                    })
            }
        }
    }
}

#[async_trait]
pub trait Reference: Send + Sync {
    type Output: Send;

    /// Resolve against `reader`, defaulting unset fields from `parent`.
    async fn resolve<R, P>(&self, reader: &R, scheme: &Scheme, parent: &P) -> Result<Self::Output, ResolveError>
    where
        R: ObjectReader,
        P: Object;
}

/// Resources that declare references to other resources.
#[async_trait]
pub trait ObjectWithReferences: Object {
    /// Resolve every declared reference, failing on the first that cannot be.
    async fn resolve_references<R: ObjectReader>(&self, reader: &R, scheme: &Scheme) -> Result<(), ResolveError>;
}

/// Reference to an arbitrary resource. Unset (empty) namespace and
/// apiVersion default to the referencing resource's own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl ObjectReference {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), name: name.into(), ..Default::default() }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Resolve with an explicit parent context instead of a parent object.
    #[instrument(level = "debug", skip_all, fields(kind = %self.kind, name = %self.name))]
    pub async fn resolve_in<R: ObjectReader>(
        &self,
        reader: &R,
        scheme: &Scheme,
        parent: &ParentContext,
    ) -> Result<Resolved, ResolveError> {
        let api_version = if self.api_version.is_empty() { &parent.api_version } else { &self.api_version };
        let namespace = if self.namespace.is_empty() { &parent.namespace } else { &self.namespace };
        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, &self.kind);
        let key = ObjectKey::new(namespace.as_str(), self.name.as_str());

        let mut obj = match reader.get_dynamic(&gvk, &key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "referenced object not found");
                return Err(ResolveError::Missing(retryable(e)));
            }
            Err(source) => {
                return Err(ResolveError::Fetch { kind: self.kind.clone(), key, source });
            }
        };
        if obj.types.is_none() {
            obj.types = Some(TypeMeta { api_version: api_version.clone(), kind: self.kind.clone() });
        }

        match scheme.decode(&obj) {
            Ok(typed) => Ok(Resolved::Typed(typed)),
            Err(e) if e.is_not_registered() => {
                debug!(gvk = %gvk_key(&gvk), "kind not registered; returning generic object");
                Ok(Resolved::Dynamic(obj))
            }
            Err(source) => Err(ResolveError::Decode { kind: self.kind.clone(), key, source }),
        }
    }
}

/// The parent's kind is only looked up when the reference leaves apiVersion unset.
fn parent_context<P: Object>(
    scheme: &Scheme,
    parent: &P,
    needs_api_version: bool,
) -> Result<ParentContext, ResolveError> {
    if needs_api_version {
        ParentContext::of(scheme, parent)
    } else {
        Ok(ParentContext::new(parent.meta().namespace.clone().unwrap_or_default(), ""))
    }
}

#[async_trait]
impl Reference for ObjectReference {
    type Output = Resolved;

    async fn resolve<R, P>(&self, reader: &R, scheme: &Scheme, parent: &P) -> Result<Resolved, ResolveError>
    where
        R: ObjectReader,
        P: Object,
    {
        let ctx = parent_context(scheme, parent, self.api_version.is_empty())?;
        self.resolve_in(reader, scheme, &ctx).await
    }
}

/// Reference to a resource in the referencing resource's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl From<&LocalObjectReference> for ObjectReference {
    fn from(r: &LocalObjectReference) -> Self {
        ObjectReference::new(r.kind.as_str(), r.name.as_str()).api_version(r.api_version.as_str())
    }
}

#[async_trait]
impl Reference for LocalObjectReference {
    type Output = Resolved;

    async fn resolve<R, P>(&self, reader: &R, scheme: &Scheme, parent: &P) -> Result<Resolved, ResolveError>
    where
        R: ObjectReader,
        P: Object,
    {
        ObjectReference::from(self).resolve(reader, scheme, parent).await
    }
}

/// Reference to a Secret in the referencing resource's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocalSecretReference {
    pub name: String,
}

#[async_trait]
impl Reference for LocalSecretReference {
    type Output = Secret;

    async fn resolve<R, P>(&self, reader: &R, scheme: &Scheme, parent: &P) -> Result<Secret, ResolveError>
    where
        R: ObjectReader,
        P: Object,
    {
        let target = ObjectReference::new("Secret", self.name.as_str()).api_version("v1");
        target.resolve(reader, scheme, parent).await?.into_object()
    }
}

/// Reference to a ConfigMap in the referencing resource's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocalConfigMapReference {
    pub name: String,
}

#[async_trait]
impl Reference for LocalConfigMapReference {
    type Output = ConfigMap;

    async fn resolve<R, P>(&self, reader: &R, scheme: &Scheme, parent: &P) -> Result<ConfigMap, ResolveError>
    where
        R: ObjectReader,
        P: Object,
    {
        let target = ObjectReference::new("ConfigMap", self.name.as_str()).api_version("v1");
        target.resolve(reader, scheme, parent).await?.into_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_are_omitted_on_the_wire() {
        let r = ObjectReference::new("Deployment", "web").api_version("apps/v1");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v, serde_json::json!({ "name": "web", "apiVersion": "apps/v1", "kind": "Deployment" }));

        let back: ObjectReference = serde_json::from_value(serde_json::json!({ "name": "db", "kind": "Secret" })).unwrap();
        assert_eq!(back, ObjectReference::new("Secret", "db"));

        let local: LocalObjectReference = serde_json::from_value(serde_json::json!({ "name": "x" })).unwrap();
        assert_eq!(ObjectReference::from(&local), ObjectReference::new("", "x"));
    }

    #[test]
    fn only_missing_is_retryable() {
        let key = ObjectKey::new("ns", "db");
        let missing = ResolveError::Missing(retryable(StoreError::NotFound { kind: "Secret".into(), key: key.clone() }));
        assert!(missing.is_retryable());
        assert!(Retry::is_retryable(&missing));
        assert_eq!(missing.to_string(), "Secret ns/db not found");

        let fetch = ResolveError::Fetch {
            kind: "Secret".into(),
            key,
            source: StoreError::Unavailable("timeout".into()),
        };
        assert!(!fetch.is_retryable());
        assert_eq!(fetch.to_string(), "failed to resolve reference to Secret ns/db: store unavailable: timeout");
    }
}
