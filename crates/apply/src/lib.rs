//! Konverge apply: converge desired manifest objects onto live cluster state
//! with ownership-aware patches.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use kube::core::GroupVersionKind;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

use konverge_catalog::{Collection, CollectionRouter, ResourceCatalog};
use konverge_core::{Error, PatchDescription, ResourceObject};
use konverge_manifest::{decode_stream, resolve};

pub const DEFAULT_FIELD_MANAGER: &str = "konverge";

fn step_timeout_default() -> Duration {
    let secs = std::env::var("KONVERGE_STEP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10);
    Duration::from_secs(secs)
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Field-manager identity tagging client-owned fields server-side.
    pub field_manager: String,
    /// Deadline for each network-bound step (fetch, create, patch).
    pub step_timeout: Duration,
    /// Namespace for namespaced objects whose manifest omits one. Never
    /// overrides an explicit namespace.
    pub ns_override: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            step_timeout: step_timeout_default(),
            ns_override: None,
        }
    }
}

/// Terminal state of one manifest object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    Created,
    Applied,
    Failed(Error),
}

/// Per-object result, in manifest order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectOutcome {
    /// Zero-based position in the manifest stream.
    pub index: usize,
    /// Empty when the document failed before its kind was known.
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub outcome: Outcome,
}

impl ObjectOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, Outcome::Failed(_))
    }

    /// "Pod sre-test/busybox-sleep", "Node worker-1", or "document 2" when
    /// the document never resolved.
    pub fn target(&self) -> String {
        if self.kind.is_empty() {
            return format!("document {}", self.index + 1);
        }
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.kind, ns, self.name),
            None => format!("{} {}", self.kind, self.name),
        }
    }

    pub fn report(&self) -> String {
        match &self.outcome {
            Outcome::Created => format!("{} created", self.target()),
            Outcome::Applied => format!("{} applied", self.target()),
            Outcome::Failed(err) => format!("{} failed: {}", self.target(), err),
        }
    }
}

/// Overlay changed metadata fields onto the accumulator.
///
/// Compares live against desired on exactly labels, annotations and
/// finalizers. Map comparison ignores order; finalizer comparison is
/// order-sensitive. A differing field is overwritten with the desired value;
/// an equal field keeps whatever the accumulator already carries, so
/// unchanged fields are never spuriously reasserted.
pub fn diff_metadata(
    mut acc: PatchDescription,
    live: &ResourceObject,
    desired: &ResourceObject,
) -> PatchDescription {
    if live.labels() != desired.labels() {
        acc.labels = Some(desired.labels());
    }
    if live.annotations() != desired.annotations() {
        acc.annotations = Some(desired.annotations());
    }
    if live.finalizers() != desired.finalizers() {
        acc.finalizers = Some(desired.finalizers());
    }
    acc
}

/// Seed a patch description with the metadata fields this field manager
/// currently owns on the live object, read from `metadata.managedFields`.
///
/// Only `Apply`-operation entries for the given manager count. A `.` key in
/// an owned map claims the whole mapping; finalizer ownership is a value set
/// (`v:"…"` elements), extracted in live order. Unowned fields stay `None`.
pub fn extract_owned(live: &ResourceObject, field_manager: &str) -> PatchDescription {
    let entries = live
        .as_json()
        .pointer("/metadata/managedFields")
        .and_then(Json::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut out = PatchDescription::default();
    for entry in entries {
        let manager = entry.get("manager").and_then(Json::as_str).unwrap_or("");
        let operation = entry.get("operation").and_then(Json::as_str).unwrap_or("");
        if manager != field_manager || operation != "Apply" {
            continue;
        }
        let meta_fields = match entry.pointer("/fieldsV1/f:metadata").and_then(Json::as_object) {
            Some(m) => m,
            None => continue,
        };

        if let Some(owned) = meta_fields.get("f:labels").and_then(Json::as_object) {
            let live_labels = live.labels();
            let picked = out.labels.get_or_insert_with(BTreeMap::new);
            if owned.contains_key(".") {
                picked.extend(live_labels);
            } else {
                for key in owned.keys().filter_map(|k| k.strip_prefix("f:")) {
                    if let Some(value) = live_labels.get(key) {
                        picked.insert(key.to_string(), value.clone());
                    }
                }
            }
        }
        if let Some(owned) = meta_fields.get("f:annotations").and_then(Json::as_object) {
            let live_annotations = live.annotations();
            let picked = out.annotations.get_or_insert_with(BTreeMap::new);
            if owned.contains_key(".") {
                picked.extend(live_annotations);
            } else {
                for key in owned.keys().filter_map(|k| k.strip_prefix("f:")) {
                    if let Some(value) = live_annotations.get(key) {
                        picked.insert(key.to_string(), value.clone());
                    }
                }
            }
        }
        if let Some(owned) = meta_fields.get("f:finalizers").and_then(Json::as_object) {
            let whole = owned.contains_key(".");
            let owned_values: Vec<&str> = owned
                .keys()
                .filter_map(|k| k.strip_prefix("v:"))
                .map(|k| k.trim_matches('"'))
                .collect();
            let seeded = out.finalizers.get_or_insert_with(Vec::new);
            for finalizer in live.finalizers() {
                if (whole || owned_values.contains(&finalizer.as_str()))
                    && !seeded.contains(&finalizer)
                {
                    seeded.push(finalizer);
                }
            }
        }
    }
    out
}

/// Render the apply document sent as the patch body: type fields, identity,
/// and only the metadata fields the description asserts. Never carries spec.
fn render_apply_document(desired: &ResourceObject, patch: &PatchDescription) -> Json {
    let mut metadata = serde_json::Map::new();
    metadata.insert("name".into(), Json::String(desired.name().to_string()));
    if let Some(ns) = desired.namespace() {
        metadata.insert("namespace".into(), Json::String(ns.to_string()));
    }
    if let Some(labels) = &patch.labels {
        metadata.insert("labels".into(), serde_json::json!(labels));
    }
    if let Some(annotations) = &patch.annotations {
        metadata.insert("annotations".into(), serde_json::json!(annotations));
    }
    if let Some(finalizers) = &patch.finalizers {
        metadata.insert("finalizers".into(), serde_json::json!(finalizers));
    }
    serde_json::json!({
        "apiVersion": desired.api_version(),
        "kind": desired.kind(),
        "metadata": metadata,
    })
}

/// Apply every object in the manifest, in decode order, independently.
///
/// One object's failure never aborts the rest; the only invocation-level
/// error is a stream that cannot be decoded at all. The catalog snapshot is
/// treated as immutable for the whole run.
pub async fn apply_manifest(
    manifest: &[u8],
    catalog: &ResourceCatalog,
    router: &dyn CollectionRouter,
    opts: &EngineOptions,
) -> Result<Vec<ObjectOutcome>, Error> {
    let raw_objects = decode_stream(manifest)?;
    info!(objects = raw_objects.len(), "manifest decoded");
    let mut outcomes = Vec::with_capacity(raw_objects.len());
    for (index, raw) in raw_objects.into_iter().enumerate() {
        let outcome = converge_one(index, raw, catalog, router, opts).await;
        if let Outcome::Failed(err) = &outcome.outcome {
            warn!(target = %outcome.target(), error = %err, "object failed");
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

async fn converge_one(
    index: usize,
    raw: konverge_manifest::RawObject,
    catalog: &ResourceCatalog,
    router: &dyn CollectionRouter,
    opts: &EngineOptions,
) -> ObjectOutcome {
    let t0 = Instant::now();
    counter!("apply_attempts", 1u64);

    let (kind, namespace, name, outcome) = match resolve(raw) {
        Err(e) => (String::new(), None, String::new(), Outcome::Failed(e)),
        Ok((mut desired, gvk)) => {
            if desired.namespace().is_none() {
                if let Some(ns) = opts.ns_override.as_deref() {
                    desired.set_namespace(ns);
                }
            }
            let kind = gvk.kind.clone();
            let namespace = desired.namespace().map(str::to_string);
            let name = desired.name().to_string();
            let outcome = match run_steps(desired, gvk, catalog, router, opts).await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::Failed(e),
            };
            (kind, namespace, name, outcome)
        }
    };

    match &outcome {
        Outcome::Failed(_) => counter!("apply_err", 1u64),
        _ => counter!("apply_ok", 1u64),
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(
        kind = %kind,
        ns = ?namespace,
        name = %name,
        took_ms = %t0.elapsed().as_millis(),
        "object processed"
    );
    ObjectOutcome {
        index,
        kind,
        namespace,
        name,
        outcome,
    }
}

async fn run_steps(
    desired: ResourceObject,
    gvk: GroupVersionKind,
    catalog: &ResourceCatalog,
    router: &dyn CollectionRouter,
    opts: &EngineOptions,
) -> Result<Outcome, Error> {
    let (collection, scope) = catalog.lookup(&gvk)?;
    let handle = router.route(&collection, scope, desired.namespace())?;

    match handle.get(desired.name(), opts.step_timeout).await? {
        None => {
            handle.create(&desired, opts.step_timeout).await?;
            Ok(Outcome::Created)
        }
        Some(live) => {
            // Specs are immutable post-creation in this model; drift is a
            // policy failure, not something to merge.
            if live.spec() != desired.spec() {
                return Err(Error::SpecImmutable(format!(
                    "live and desired {} {} have different specs; spec cannot be updated at runtime",
                    gvk.kind,
                    desired.name()
                )));
            }
            let seed = extract_owned(&live, &opts.field_manager);
            let patch = diff_metadata(seed, &live, &desired);
            let apply_doc = render_apply_document(&desired, &patch);
            handle.patch(desired.name(), &apply_doc, opts.step_timeout).await?;
            Ok(Outcome::Applied)
        }
    }
}
