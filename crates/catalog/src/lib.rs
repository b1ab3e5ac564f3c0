//! Konverge resource catalog and collection routing.
//!
//! The catalog is a read-only snapshot of the cluster's kind→collection
//! mappings, taken once per invocation from kube discovery. The router binds
//! resolved collections to endpoint handles; the `Collection` trait is the
//! transport seam the convergence engine drives.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope as DiscoveryScope},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use konverge_core::{Error, ResourceObject, Result};

/// Whether a collection is bound to a namespace or spans the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// One served kind→collection mapping from discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name addressing the collection on the wire.
    pub resource: String,
    pub namespaced: bool,
}

/// An addressable collection, resolved from a type identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub group: String,
    pub version: String,
    pub resource: String,
    /// Kind carried along for endpoint construction and reporting.
    pub kind: String,
}

impl CollectionRef {
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Immutable snapshot of all known kind→collection mappings for one
/// invocation. Not refreshed mid-run; a changed server resource set is an
/// accepted staleness window bounded by invocation duration.
#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    entries: Vec<CatalogEntry>,
}

impl ResourceCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a type identity to its collection and scope.
    ///
    /// Fails when no entry matches, and also when more than one does: an
    /// ambiguous catalog is a fatal mapping error, never resolved by
    /// preference order.
    pub fn lookup(&self, gvk: &GroupVersionKind) -> Result<(CollectionRef, Scope)> {
        let mut matches = self
            .entries
            .iter()
            .filter(|e| e.group == gvk.group && e.version == gvk.version && e.kind == gvk.kind);
        let entry = matches
            .next()
            .ok_or_else(|| Error::Mapping(format!("no served collection for {}", gvk_key(gvk))))?;
        if matches.next().is_some() {
            return Err(Error::Mapping(format!(
                "ambiguous catalog entries for {}",
                gvk_key(gvk)
            )));
        }
        let scope = if entry.namespaced {
            Scope::Namespaced
        } else {
            Scope::Cluster
        };
        Ok((
            CollectionRef {
                group: entry.group.clone(),
                version: entry.version.clone(),
                resource: entry.resource.clone(),
                kind: entry.kind.clone(),
            },
            scope,
        ))
    }
}

/// Snapshot served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> anyhow::Result<ResourceCatalog> {
    let discovery = Discovery::new(client).run().await?;
    let mut entries = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            entries.push(CatalogEntry {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                resource: ar.plural.clone(),
                namespaced: matches!(caps.scope, DiscoveryScope::Namespaced),
            });
        }
    }
    // Stable-ish order
    entries.sort_by(|a, b| {
        a.group
            .cmp(&b.group)
            .then(a.version.cmp(&b.version))
            .then(a.kind.cmp(&b.kind))
    });
    info!(entries = entries.len(), "resource catalog snapshot ready");
    Ok(ResourceCatalog::new(entries))
}

/// Transport operations on one bound collection endpoint. Implementations
/// are parameterized by a field-manager identity; every call is bounded by
/// the caller-supplied deadline.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Fetch by name. `Ok(None)` means not found; any other failure is an error.
    async fn get(&self, name: &str, deadline: Duration) -> Result<Option<ResourceObject>>;

    /// Create the desired object, stamped with this client's ownership.
    async fn create(&self, desired: &ResourceObject, deadline: Duration) -> Result<ResourceObject>;

    /// Apply-patch the named object with a rendered ownership document.
    async fn patch(&self, name: &str, apply_doc: &Json, deadline: Duration)
        -> Result<ResourceObject>;
}

/// Produces collection handles for resolved (collection, scope, namespace)
/// targets. Pure routing; no I/O.
pub trait CollectionRouter: Send + Sync {
    fn route(
        &self,
        collection: &CollectionRef,
        scope: Scope,
        namespace: Option<&str>,
    ) -> Result<Arc<dyn Collection>>;
}

/// Namespace binding rules shared by router implementations: a namespaced
/// collection requires a non-empty namespace, a cluster collection ignores
/// the argument entirely.
pub fn bind_namespace<'a>(scope: Scope, namespace: Option<&'a str>) -> Result<Option<&'a str>> {
    match scope {
        Scope::Namespaced => match namespace {
            Some(ns) if !ns.is_empty() => Ok(Some(ns)),
            _ => Err(Error::Validation(
                "namespace required for namespaced kind".into(),
            )),
        },
        Scope::Cluster => Ok(None),
    }
}

/// Collection handle over a dynamic kube Api.
pub struct KubeCollection {
    api: Api<DynamicObject>,
    field_manager: String,
}

impl KubeCollection {
    fn to_object(obj: &DynamicObject) -> Result<ResourceObject> {
        let doc = serde_json::to_value(obj)
            .map_err(|e| Error::Transport(format!("serializing live object: {}", e)))?;
        ResourceObject::from_document(doc)
            .map_err(|e| Error::Transport(format!("malformed live object: {}", e)))
    }
}

#[async_trait]
impl Collection for KubeCollection {
    async fn get(&self, name: &str, deadline: Duration) -> Result<Option<ResourceObject>> {
        match tokio::time::timeout(deadline, self.api.get_opt(name)).await {
            Err(_) => Err(Error::Timeout(format!(
                "get {} exceeded {:?}",
                name, deadline
            ))),
            Ok(Ok(None)) => Ok(None),
            Ok(Ok(Some(obj))) => Self::to_object(&obj).map(Some),
            Ok(Err(e)) => Err(Error::Transport(format!("get {}: {}", name, e))),
        }
    }

    async fn create(&self, desired: &ResourceObject, deadline: Duration) -> Result<ResourceObject> {
        let mut obj: DynamicObject = serde_json::from_value(desired.as_json().clone())
            .map_err(|e| Error::Decode(format!("shaping object for create: {}", e)))?;
        // Mark this client as the authoritative manager for apply-style ops.
        obj.metadata.managed_fields = Some(vec![ManagedFieldsEntry {
            manager: Some(self.field_manager.clone()),
            operation: Some("Apply".to_string()),
            ..Default::default()
        }]);
        match tokio::time::timeout(deadline, self.api.create(&PostParams::default(), &obj)).await {
            Err(_) => Err(Error::Timeout(format!(
                "create {} exceeded {:?}",
                desired.name(),
                deadline
            ))),
            Ok(Ok(created)) => Self::to_object(&created),
            Ok(Err(e)) => Err(Error::Transport(format!("create {}: {}", desired.name(), e))),
        }
    }

    async fn patch(
        &self,
        name: &str,
        apply_doc: &Json,
        deadline: Duration,
    ) -> Result<ResourceObject> {
        let pp = PatchParams::apply(&self.field_manager);
        match tokio::time::timeout(deadline, self.api.patch(name, &pp, &Patch::Apply(apply_doc)))
            .await
        {
            Err(_) => Err(Error::Timeout(format!(
                "patch {} exceeded {:?}",
                name, deadline
            ))),
            Ok(Ok(patched)) => Self::to_object(&patched),
            Ok(Err(e)) => Err(Error::Transport(format!("patch {}: {}", name, e))),
        }
    }
}

/// Router over a kube client. Handles are cached and shared by every object
/// routed to the same collection+namespace within one invocation.
pub struct KubeRouter {
    client: Client,
    field_manager: String,
    handles: Mutex<HashMap<(String, Option<String>), Arc<KubeCollection>>>,
}

impl KubeRouter {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }
}

impl CollectionRouter for KubeRouter {
    fn route(
        &self,
        collection: &CollectionRef,
        scope: Scope,
        namespace: Option<&str>,
    ) -> Result<Arc<dyn Collection>> {
        let bound = bind_namespace(scope, namespace)?;
        let key = (collection.key(), bound.map(str::to_string));
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = handles.get(&key) {
            return Ok(handle.clone());
        }
        let gvk = GroupVersionKind {
            group: collection.group.clone(),
            version: collection.version.clone(),
            kind: collection.kind.clone(),
        };
        let ar = ApiResource::from_gvk_with_plural(&gvk, &collection.resource);
        let api: Api<DynamicObject> = match bound {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        debug!(collection = %key.0, ns = ?key.1, "collection handle bound");
        let handle = Arc::new(KubeCollection {
            api,
            field_manager: self.field_manager.clone(),
        });
        handles.insert(key, handle.clone());
        Ok(handle)
    }
}
