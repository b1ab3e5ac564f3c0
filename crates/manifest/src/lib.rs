//! Konverge manifest decoding: multi-document byte streams into raw objects,
//! and raw objects into typed resolution targets.

#![forbid(unsafe_code)]

use kube::core::GroupVersionKind;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use konverge_core::{Error, ResourceObject, Result};

fn max_yaml_bytes() -> usize {
    std::env::var("KONVERGE_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KONVERGE_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Fast precheck: keep a running counter and bail early when exceeding max
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// One undecoded manifest document. Produced only by [`decode_stream`],
/// in input order; consumed by [`resolve`].
#[derive(Debug, Clone)]
pub struct RawObject {
    doc: Json,
}

/// Split a byte stream of zero or more YAML/JSON documents into raw objects.
///
/// Empty and whitespace-only documents are skipped, not emitted. End of input
/// terminates the sequence; an empty stream yields an empty vec. A document
/// that fails to parse fails the whole stream.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<RawObject>> {
    if bytes.len() > max_yaml_bytes() {
        return Err(Error::Decode(format!(
            "manifest too large (>{} bytes)",
            max_yaml_bytes()
        )));
    }
    let mut out = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(bytes) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::Decode(format!("parsing manifest document {}: {}", out.len(), e)))?;
        if matches!(value, serde_yaml::Value::Null) {
            continue;
        }
        let doc = serde_json::to_value(value)
            .map_err(|e| Error::Decode(format!("converting document {} to JSON: {}", out.len(), e)))?;
        if json_node_budget_exceeded(&doc, max_yaml_nodes()) {
            return Err(Error::Decode(format!(
                "manifest document {} too complex (>{} nodes)",
                out.len(),
                max_yaml_nodes()
            )));
        }
        out.push(RawObject { doc });
    }
    debug!(documents = out.len(), "manifest stream decoded");
    Ok(out)
}

/// Parse a raw object into its generic representation and extract the type
/// identity used for catalog resolution. The identity is consumed by the
/// lookup and not retained on the object.
pub fn resolve(raw: RawObject) -> Result<(ResourceObject, GroupVersionKind)> {
    let api_version = raw
        .doc
        .get("apiVersion")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::Decode("manifest document missing apiVersion".into()))?;
    let kind = raw
        .doc
        .get("kind")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::Decode("manifest document missing kind".into()))?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    if version.is_empty() || kind.is_empty() {
        return Err(Error::Decode(format!(
            "malformed type fields: apiVersion={:?} kind={:?}",
            api_version, kind
        )));
    }
    let gvk = GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    };
    let object = ResourceObject::from_document(raw.doc)?;
    Ok((object, gvk))
}
