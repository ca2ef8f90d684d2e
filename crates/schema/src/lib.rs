//! opkit schema: a registry mapping Rust types to their group/version/kind
//! identity and decoding generic objects back into registered types.

#![forbid(unsafe_code)]

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, GroupVersionKind};
use opkit_core::Object;
use serde_json::Value as Json;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("no kind registered for type {0}")]
    KindUnknown(&'static str),
    #[error("{api_version}, Kind={kind} is not registered")]
    NotRegistered { api_version: String, kind: String },
    #[error("object has no apiVersion/kind")]
    MissingTypeMeta,
    #[error("decoding {kind}: {source}")]
    Decode { kind: String, source: serde_json::Error },
}

impl SchemaError {
    pub fn is_not_registered(&self) -> bool {
        matches!(self, SchemaError::NotRegistered { .. })
    }
}

/// Split an apiVersion into (group, version); core kinds have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// A decoded object of a registered type, held type-erased until downcast.
pub struct TypedObject {
    gvk: GroupVersionKind,
    meta: ObjectMeta,
    inner: Box<dyn Any + Send + Sync>,
}

impl TypedObject {
    pub fn gvk(&self) -> &GroupVersionKind { &self.gvk }

    pub fn meta(&self) -> &ObjectMeta { &self.meta }

    pub fn is<K: 'static>(&self) -> bool { self.inner.is::<K>() }

    pub fn downcast_ref<K: 'static>(&self) -> Option<&K> { self.inner.downcast_ref::<K>() }

    /// Recover the concrete value, or get `self` back on a type mismatch.
    pub fn downcast<K: 'static>(self) -> Result<K, Self> {
        let TypedObject { gvk, meta, inner } = self;
        match inner.downcast::<K>() {
            Ok(obj) => Ok(*obj),
            Err(inner) => Err(TypedObject { gvk, meta, inner }),
        }
    }
}

impl fmt::Debug for TypedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedObject").field("gvk", &gvk_key(&self.gvk)).finish_non_exhaustive()
    }
}

type Decoder = Box<dyn Fn(Json) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> + Send + Sync>;

struct Registration {
    gvk: GroupVersionKind,
    decode: Decoder,
}

/// Type registry consulted by the reference resolver.
#[derive(Default)]
pub struct Scheme {
    by_type: HashMap<TypeId, GroupVersionKind>,
    by_kind: HashMap<(String, String), Registration>,
}

impl Scheme {
    pub fn new() -> Self { Self::default() }

    pub fn register<K: Object>(&mut self) -> &mut Self {
        let gvk = K::type_gvk();
        trace!(gvk = %gvk_key(&gvk), "registering kind");
        self.by_type.insert(TypeId::of::<K>(), gvk.clone());
        let decode: Decoder = Box::new(|v| {
            let obj: K = serde_json::from_value(v)?;
            Ok(Box::new(obj) as Box<dyn Any + Send + Sync>)
        });
        self.by_kind.insert((gvk.api_version(), gvk.kind.clone()), Registration { gvk, decode });
        self
    }

    /// Builder form of [`Scheme::register`].
    pub fn with<K: Object>(mut self) -> Self {
        self.register::<K>();
        self
    }

    pub fn is_registered(&self, gvk: &GroupVersionKind) -> bool {
        self.by_kind.contains_key(&(gvk.api_version(), gvk.kind.clone()))
    }

    /// Registered identity of `K`.
    pub fn gvk_of<K: 'static>(&self) -> Result<GroupVersionKind, SchemaError> {
        self.by_type
            .get(&TypeId::of::<K>())
            .cloned()
            .ok_or(SchemaError::KindUnknown(std::any::type_name::<K>()))
    }

    /// Registered identity of the value's type.
    pub fn object_kind<K: Object>(&self, _obj: &K) -> Result<GroupVersionKind, SchemaError> {
        self.gvk_of::<K>()
    }

    /// Decode a generic object into its registered concrete type.
    pub fn decode(&self, obj: &DynamicObject) -> Result<TypedObject, SchemaError> {
        let types = obj.types.as_ref().ok_or(SchemaError::MissingTypeMeta)?;
        let reg = self
            .by_kind
            .get(&(types.api_version.clone(), types.kind.clone()))
            .ok_or_else(|| SchemaError::NotRegistered {
                api_version: types.api_version.clone(),
                kind: types.kind.clone(),
            })?;
        let raw = serde_json::to_value(obj)
            .map_err(|source| SchemaError::Decode { kind: types.kind.clone(), source })?;
        let inner = (reg.decode)(raw)
            .map_err(|source| SchemaError::Decode { kind: types.kind.clone(), source })?;
        Ok(TypedObject { gvk: reg.gvk.clone(), meta: obj.metadata.clone(), inner })
    }
}

impl fmt::Debug for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.by_kind.values().map(|r| gvk_key(&r.gvk)).collect();
        kinds.sort();
        f.debug_struct("Scheme").field("kinds", &kinds).finish()
    }
}
