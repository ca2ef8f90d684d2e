//! Content fingerprints and the annotation slot they are stored in.
//!
//! The fingerprint is a 32-bit FNV-1a digest over a canonical JSON rendering of
//! the object. Store-assigned bookkeeping (resourceVersion, uid, timestamps,
//! managed fields), the status block and the fingerprint annotation itself are
//! left out, so a live object and the template it was written from hash alike.

use serde::Serialize;
use serde_json::Value as Json;

use crate::Object;

/// Annotation holding the fingerprint of the template behind the last write.
/// Must stay bit-exact across releases.
pub const ANNOTATION_KEY: &str = "gpu-ninja.com/template-hash";

const BOOKKEEPING_FIELDS: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

struct Fnv1a32(u32);

impl Fnv1a32 {
    fn new() -> Self { Self(FNV32_OFFSET) }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u32::from(*b);
            self.0 = self.0.wrapping_mul(FNV32_PRIME);
        }
    }

    fn finish(&self) -> u32 { self.0 }
}

/// Deterministic short digest (8 lowercase hex chars) of an object's semantic content.
pub fn fingerprint<T: Serialize + ?Sized>(obj: &T) -> Result<String, serde_json::Error> {
    let mut v = serde_json::to_value(obj)?;
    strip_transient(&mut v);
    let mut h = Fnv1a32::new();
    write_canonical(&v, &mut h);
    let digest = format!("{:08x}", h.finish());
    tracing::trace!(fingerprint = %digest, "computed content fingerprint");
    Ok(digest)
}

/// Stored fingerprint, or the empty string when none was written.
pub fn read_fingerprint<K: Object>(obj: &K) -> String {
    obj.annotation(ANNOTATION_KEY).unwrap_or_default().to_string()
}

/// Upsert the fingerprint annotation in memory. Does not touch the store.
pub fn write_fingerprint<K: Object>(obj: &mut K, value: &str) {
    obj.set_annotation(ANNOTATION_KEY, value.to_string());
}

fn strip_transient(v: &mut Json) {
    let Some(root) = v.as_object_mut() else { return };
    root.remove("status");
    let Some(meta) = root.get_mut("metadata").and_then(Json::as_object_mut) else { return };
    for field in BOOKKEEPING_FIELDS {
        meta.remove(*field);
    }
    let emptied = match meta.get_mut("annotations").and_then(Json::as_object_mut) {
        Some(annotations) => {
            annotations.remove(ANNOTATION_KEY);
            annotations.is_empty()
        }
        None => false,
    };
    if emptied {
        meta.remove("annotations");
    }
}

// Object keys are written sorted so the digest never depends on map iteration order.
fn write_canonical(v: &Json, h: &mut Fnv1a32) {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            h.write(b"{");
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 { h.write(b","); }
                h.write(Json::String(k.clone()).to_string().as_bytes());
                h.write(b":");
                if let Some(child) = map.get(k) {
                    write_canonical(child, h);
                }
            }
            h.write(b"}");
        }
        Json::Array(items) => {
            h.write(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 { h.write(b","); }
                write_canonical(item, h);
            }
            h.write(b"]");
        }
        scalar => h.write(scalar.to_string().as_bytes()),
    }
}
