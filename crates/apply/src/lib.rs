//! opkit apply: converge live objects to caller-supplied desired state.
//!
//! Every operation is one read, at most one write, and one re-read. Conflicts
//! reported by the store are surfaced, never retried here: the caller's
//! control loop requeues.

#![forbid(unsafe_code)]

use std::time::Instant;

use metrics::{counter, histogram};
use opkit_core::{
    fingerprint, read_fingerprint, write_fingerprint, Object, ObjectKey, ObjectReader,
    ObjectWriter, Retry, StoreError,
};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to hash {kind} {key}: {source}")]
    Hash { kind: String, key: ObjectKey, source: serde_json::Error },
    #[error("failed to get {kind} {key}: {source}")]
    Get { kind: String, key: ObjectKey, source: StoreError },
    #[error("failed to mutate {kind} {key}: {source}")]
    Mutate { kind: String, key: ObjectKey, source: anyhow::Error },
    #[error("failed to create {kind} {key}: {source}")]
    Create { kind: String, key: ObjectKey, source: StoreError },
    #[error("failed to update {kind} {key}: {source}")]
    Update { kind: String, key: ObjectKey, source: StoreError },
    #[error("failed to update status of {kind} {key}: {source}")]
    UpdateStatus { kind: String, key: ObjectKey, source: StoreError },
    #[error("failed to get updated {kind} {key}: {source}")]
    Refetch { kind: String, key: ObjectKey, source: StoreError },
}

impl ReconcileError {
    pub fn key(&self) -> &ObjectKey {
        match self {
            ReconcileError::Hash { key, .. }
            | ReconcileError::Get { key, .. }
            | ReconcileError::Mutate { key, .. }
            | ReconcileError::Create { key, .. }
            | ReconcileError::Update { key, .. }
            | ReconcileError::UpdateStatus { key, .. }
            | ReconcileError::Refetch { key, .. } => key,
        }
    }

    fn op(&self) -> &'static str {
        match self {
            ReconcileError::Hash { .. } => "hash",
            ReconcileError::Get { .. } => "get",
            ReconcileError::Mutate { .. } => "mutate",
            ReconcileError::Create { .. } => "create",
            ReconcileError::Update { .. } => "update",
            ReconcileError::UpdateStatus { .. } => "update_status",
            ReconcileError::Refetch { .. } => "refetch",
        }
    }

    /// Version-token conflict (or already-exists) reported by the store.
    pub fn is_conflict(&self) -> bool {
        match self {
            ReconcileError::Create { source, .. }
            | ReconcileError::Update { source, .. }
            | ReconcileError::UpdateStatus { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

// Nothing raised here carries the retry tag; requeue policy belongs to the caller.
impl Retry for ReconcileError {
    fn is_retryable(&self) -> bool {
        false
    }
}

fn failed(err: ReconcileError) -> ReconcileError {
    counter!("opkit_reconcile_errors_total", 1u64, "op" => err.op());
    err
}

/// The fingerprint-skip outcome of a template convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
        }
    }
}

/// Which entry point a convergence came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvergeOp {
    Template,
    Mutate,
}

impl ConvergeOp {
    fn as_str(self) -> &'static str {
        match self {
            ConvergeOp::Template => "template",
            ConvergeOp::Mutate => "mutate",
        }
    }
}

fn converge_labels(op: ConvergeOp, outcome: Outcome) -> [(&'static str, &'static str); 2] {
    [("op", op.as_str()), ("outcome", outcome.as_str())]
}

fn record_converge(op: ConvergeOp, outcome: Outcome) {
    let [(_, op), (_, outcome)] = converge_labels(op, outcome);
    counter!("opkit_converge_total", 1u64, "op" => op, "outcome" => outcome);
}

/// Re-read after a successful write. A not-found here is a visibility gap,
/// so the write response is returned instead.
async fn refetch<S, K>(store: &S, key: &ObjectKey, written: K) -> Result<K, ReconcileError>
where
    S: ObjectReader,
    K: Object,
{
    match store.get::<K>(key).await {
        Ok(fresh) => Ok(fresh),
        Err(e) if e.is_not_found() => {
            warn!(key = %key, "written object not visible yet; returning write response");
            Ok(written)
        }
        Err(source) => Err(failed(ReconcileError::Refetch {
            kind: K::kind(&()).into_owned(),
            key: key.clone(),
            source,
        })),
    }
}

/// Ensure a live object matching `template` exists, writing only when the
/// stored fingerprint differs from the template's.
pub async fn create_or_update_from_template<S, K>(store: &S, template: &K) -> Result<K, ReconcileError>
where
    S: ObjectWriter,
    K: Object,
{
    create_or_update_from_template_with_outcome(store, template).await.map(|(obj, _)| obj)
}

/// Same as [`create_or_update_from_template`], also reporting what was done.
#[instrument(level = "debug", skip_all, fields(kind = %K::kind(&()), key = %template.key()))]
pub async fn create_or_update_from_template_with_outcome<S, K>(
    store: &S,
    template: &K,
) -> Result<(K, Outcome), ReconcileError>
where
    S: ObjectWriter,
    K: Object,
{
    let key = template.key();
    let kind = K::kind(&()).into_owned();
    let hash = fingerprint(template).map_err(|source| {
        failed(ReconcileError::Hash { kind: kind.clone(), key: key.clone(), source })
    })?;

    let mut obj = template.clone();
    let t0 = Instant::now();
    let (written, outcome) = match store.get::<K>(&key).await {
        Err(e) if e.is_not_found() => {
            write_fingerprint(&mut obj, &hash);
            let created = store.create(&obj).await.map_err(|source| {
                failed(ReconcileError::Create { kind: kind.clone(), key: key.clone(), source })
            })?;
            info!(fingerprint = %hash, "created from template");
            (created, Outcome::Created)
        }
        Err(source) => {
            return Err(failed(ReconcileError::Get { kind, key, source }));
        }
        Ok(live) => {
            let stored = read_fingerprint(&live);
            if stored == hash {
                debug!(fingerprint = %hash, "fingerprint unchanged; skipping write");
                record_converge(ConvergeOp::Template, Outcome::Unchanged);
                return Ok((live, Outcome::Unchanged));
            }
            // template content, guarded by the live version token
            obj.meta_mut().resource_version = live.meta().resource_version.clone();
            write_fingerprint(&mut obj, &hash);
            let updated = store.update(&obj).await.map_err(|source| {
                failed(ReconcileError::Update { kind: kind.clone(), key: key.clone(), source })
            })?;
            info!(previous = %stored, fingerprint = %hash, "updated from template");
            (updated, Outcome::Updated)
        }
    };
    histogram!("opkit_write_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    record_converge(ConvergeOp::Template, outcome);

    let fresh = refetch(store, &key, written).await?;
    Ok((fresh, outcome))
}

/// Fetch-or-initialize `key`, apply `mutate`, then create or update.
///
/// `blank` is used only when the object does not exist yet; the key is
/// stamped onto it before `mutate` runs. Pass `|_| Ok(())` for no mutation.
#[instrument(level = "debug", skip_all, fields(kind = %K::kind(&()), key = %key))]
pub async fn create_or_update<S, K, F>(
    store: &S,
    key: &ObjectKey,
    blank: K,
    mutate: F,
) -> Result<K, ReconcileError>
where
    S: ObjectWriter,
    K: Object,
    F: FnOnce(&mut K) -> anyhow::Result<()> + Send,
{
    let kind = K::kind(&()).into_owned();
    let (mut obj, exists) = match store.get::<K>(key).await {
        Ok(live) => (live, true),
        Err(e) if e.is_not_found() => {
            let mut obj = blank;
            obj.stamp_key(key);
            (obj, false)
        }
        Err(source) => {
            return Err(failed(ReconcileError::Get { kind, key: key.clone(), source }));
        }
    };

    mutate(&mut obj).map_err(|source| {
        failed(ReconcileError::Mutate { kind: kind.clone(), key: key.clone(), source })
    })?;

    let t0 = Instant::now();
    let (written, outcome) = if exists {
        let updated = store.update(&obj).await.map_err(|source| {
            failed(ReconcileError::Update { kind: kind.clone(), key: key.clone(), source })
        })?;
        (updated, Outcome::Updated)
    } else {
        let created = store.create(&obj).await.map_err(|source| {
            failed(ReconcileError::Create { kind: kind.clone(), key: key.clone(), source })
        })?;
        (created, Outcome::Created)
    };
    histogram!("opkit_write_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    record_converge(ConvergeOp::Mutate, outcome);
    info!(outcome = outcome.as_str(), "wrote object");

    refetch(store, key, written).await
}

/// Fetch `key`, apply `mutate`, and write the status sub-resource.
///
/// There is no fingerprint skip here: a successful `mutate` always leads to
/// a status write.
#[instrument(level = "debug", skip_all, fields(kind = %K::kind(&()), key = %key))]
pub async fn update_status<S, K, F>(store: &S, key: &ObjectKey, mutate: F) -> Result<K, ReconcileError>
where
    S: ObjectWriter,
    K: Object,
    F: FnOnce(&mut K) -> anyhow::Result<()> + Send,
{
    let kind = K::kind(&()).into_owned();
    let mut obj = store.get::<K>(key).await.map_err(|source| {
        failed(ReconcileError::Get { kind: kind.clone(), key: key.clone(), source })
    })?;

    mutate(&mut obj).map_err(|source| {
        failed(ReconcileError::Mutate { kind: kind.clone(), key: key.clone(), source })
    })?;

    let t0 = Instant::now();
    let written = store.update_status(&obj).await.map_err(|source| {
        failed(ReconcileError::UpdateStatus { kind: kind.clone(), key: key.clone(), source })
    })?;
    histogram!("opkit_write_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("opkit_status_writes_total", 1u64);
    debug!("status written");

    refetch(store, key, written).await
}
