//! Manifest intake: YAML in, JSON plus identity out.

use anyhow::{anyhow, Context, Result};
use kube::core::GroupVersionKind;
use opkit_core::ObjectKey;
use opkit_schema::parse_api_version;
use serde_json::Value as Json;

const DEFAULT_NAMESPACE: &str = "default";

pub fn max_manifest_bytes() -> usize {
    std::env::var("OPKIT_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1 << 20) // 1 MiB default
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub json: Json,
    pub gvk: GroupVersionKind,
    pub key: ObjectKey,
}

pub fn parse_manifest(yaml: &str, ns_override: Option<&str>) -> Result<Manifest> {
    parse_manifest_with_limit(yaml, ns_override, max_manifest_bytes())
}

/// Parse one YAML document. The effective namespace (override, then the
/// manifest's own, then `default`) is written back into `metadata`.
pub fn parse_manifest_with_limit(yaml: &str, ns_override: Option<&str>, max_bytes: usize) -> Result<Manifest> {
    if yaml.len() > max_bytes {
        return Err(anyhow!("manifest too large (>{} bytes)", max_bytes));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
    let mut json = serde_json::to_value(val).context("converting YAML to JSON")?;
    let api_version = json.get("apiVersion").and_then(Json::as_str).ok_or_else(|| anyhow!("manifest missing apiVersion"))?;
    let kind = json.get("kind").and_then(Json::as_str).ok_or_else(|| anyhow!("manifest missing kind"))?;
    let (group, version) = parse_api_version(api_version);
    let gvk = GroupVersionKind::gvk(&group, &version, kind);

    let meta = json
        .get_mut("metadata")
        .and_then(Json::as_object_mut)
        .ok_or_else(|| anyhow!("manifest missing metadata"))?;
    let name = meta
        .get("name")
        .and_then(Json::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("manifest missing metadata.name"))?
        .to_string();
    let namespace = ns_override
        .map(str::to_string)
        .or_else(|| meta.get("namespace").and_then(Json::as_str).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    meta.insert("namespace".into(), Json::String(namespace.clone()));

    Ok(Manifest { json, gvk, key: ObjectKey::new(namespace, name) })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CM: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  mode: fast\n";

    #[test]
    fn identity_and_default_namespace() {
        let m = parse_manifest_with_limit(CM, None, 1024).unwrap();
        assert_eq!(m.gvk, GroupVersionKind::gvk("", "v1", "ConfigMap"));
        assert_eq!(m.key, ObjectKey::new("default", "settings"));
        assert_eq!(m.json["metadata"]["namespace"], "default");
        assert_eq!(m.json["data"]["mode"], "fast");
    }

    #[test]
    fn override_wins_over_manifest_namespace() {
        let yaml = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: a\n";
        let m = parse_manifest_with_limit(yaml, Some("b"), 1024).unwrap();
        assert_eq!(m.gvk, GroupVersionKind::gvk("apps", "v1", "Deployment"));
        assert_eq!(m.key.to_string(), "b/web");
    }

    #[test]
    fn default_cap_is_one_mebibyte() {
        if std::env::var_os("OPKIT_MAX_MANIFEST_BYTES").is_none() {
            assert_eq!(max_manifest_bytes(), 1_048_576);
        }
    }

    #[test]
    fn rejects_oversized_and_incomplete_manifests() {
        let err = parse_manifest_with_limit(CM, None, 10).unwrap_err();
        assert!(err.to_string().contains("too large"));
        let err = parse_manifest_with_limit("kind: ConfigMap\nmetadata:\n  name: x\n", None, 1024).unwrap_err();
        assert!(err.to_string().contains("apiVersion"));
        let err = parse_manifest_with_limit("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", None, 1024).unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }
}
