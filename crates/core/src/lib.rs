//! Konverge core types and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

static NULL: Json = Json::Null;

/// Errors suitable for per-object reporting (and transport over RPC later).
#[derive(Debug, thiserror::Error, Clone, Serialize, Deserialize)]
pub enum Error {
    /// Manifest bytes are not well-formed YAML/JSON, or lack required type fields.
    #[error("decode: {0}")]
    Decode(String),
    /// No served collection for the kind, or the catalog is ambiguous.
    #[error("mapping: {0}")]
    Mapping(String),
    /// Caller-level contract violation (e.g. missing namespace).
    #[error("validation: {0}")]
    Validation(String),
    /// Desired spec differs from live spec on an existing object.
    #[error("spec immutable: {0}")]
    SpecImmutable(String),
    /// A network step exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Server/transport failure, passed through with context.
    #[error("transport: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A decoded manifest or live object, structurally generic over kinds.
///
/// Backed by the raw JSON document; the typed accessors cover the handful of
/// fields the convergence pipeline interprets. Everything else (spec, status)
/// stays opaque. Label/annotation accessors canonicalize absent, null and
/// empty mappings to the empty map so structural comparison never sees an
/// empty-vs-nil difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceObject {
    doc: Json,
}

impl ResourceObject {
    /// Wrap a decoded document. Requires a JSON object with a non-empty
    /// `metadata.name`; everything else is validated lazily by accessors.
    pub fn from_document(doc: Json) -> Result<Self> {
        if !doc.is_object() {
            return Err(Error::Decode("manifest document is not an object".into()));
        }
        let name = doc
            .pointer("/metadata/name")
            .and_then(Json::as_str)
            .unwrap_or("");
        if name.is_empty() {
            return Err(Error::Validation(
                "metadata.name is required and must be non-empty".into(),
            ));
        }
        Ok(Self { doc })
    }

    pub fn as_json(&self) -> &Json {
        &self.doc
    }

    pub fn into_json(self) -> Json {
        self.doc
    }

    pub fn api_version(&self) -> &str {
        self.doc.get("apiVersion").and_then(Json::as_str).unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.doc.get("kind").and_then(Json::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.doc
            .pointer("/metadata/name")
            .and_then(Json::as_str)
            .unwrap_or("")
    }

    /// Namespace, with the empty string canonicalized to None.
    pub fn namespace(&self) -> Option<&str> {
        self.doc
            .pointer("/metadata/namespace")
            .and_then(Json::as_str)
            .filter(|ns| !ns.is_empty())
    }

    /// Fill in the namespace; used when a manifest omits it and the caller
    /// supplied an override. Does not touch an explicit namespace.
    pub fn set_namespace(&mut self, namespace: &str) {
        if let Some(meta) = self.doc.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("/metadata/labels")
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("/metadata/annotations")
    }

    /// Finalizers in manifest order. Order is significant for comparison.
    pub fn finalizers(&self) -> Vec<String> {
        self.doc
            .pointer("/metadata/finalizers")
            .and_then(Json::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Json::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Opaque spec payload; absent specs canonicalize to JSON null.
    pub fn spec(&self) -> &Json {
        self.doc.get("spec").unwrap_or(&NULL)
    }

    fn string_map(&self, pointer: &str) -> BTreeMap<String, String> {
        self.doc
            .pointer(pointer)
            .and_then(Json::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Accumulator of metadata fields the client asserts ownership of in an
/// apply patch. `None` means "do not assert this field"; a field is only set
/// by ownership extraction (previously owned) or by the metadata differ
/// (changed and therefore claimed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescription {
    pub labels: Option<BTreeMap<String, String>>,
    pub annotations: Option<BTreeMap<String, String>>,
    pub finalizers: Option<Vec<String>>,
}
