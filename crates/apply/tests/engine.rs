#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;

use konverge_apply::{apply_manifest, EngineOptions, Outcome};
use konverge_catalog::{
    bind_namespace, CatalogEntry, Collection, CollectionRef, CollectionRouter, ResourceCatalog,
    Scope,
};
use konverge_core::{Error, ResourceObject};

/// In-memory stand-in for one collection endpoint. Stores objects by name
/// and records every apply document it receives.
#[derive(Default)]
struct MemoryCollection {
    objects: Mutex<HashMap<String, Json>>,
    patches: Mutex<Vec<Json>>,
    latency: Option<Duration>,
}

impl MemoryCollection {
    fn check_deadline(&self, deadline: Duration) -> Result<(), Error> {
        match self.latency {
            Some(latency) if latency > deadline => Err(Error::Timeout(
                "simulated step overran its deadline".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn get(&self, name: &str, deadline: Duration) -> Result<Option<ResourceObject>, Error> {
        self.check_deadline(deadline)?;
        let objects = self.objects.lock().unwrap();
        objects
            .get(name)
            .cloned()
            .map(ResourceObject::from_document)
            .transpose()
    }

    async fn create(
        &self,
        desired: &ResourceObject,
        deadline: Duration,
    ) -> Result<ResourceObject, Error> {
        self.check_deadline(deadline)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(desired.name()) {
            return Err(Error::Transport(format!("{} already exists", desired.name())));
        }
        objects.insert(desired.name().to_string(), desired.as_json().clone());
        Ok(desired.clone())
    }

    async fn patch(
        &self,
        name: &str,
        apply_doc: &Json,
        deadline: Duration,
    ) -> Result<ResourceObject, Error> {
        self.check_deadline(deadline)?;
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(name)
            .ok_or_else(|| Error::Transport(format!("{} not found", name)))?;
        // Overlay the asserted metadata fields, as the server would for the
        // applying manager.
        if let Some(meta) = apply_doc.get("metadata").and_then(Json::as_object) {
            for field in ["labels", "annotations", "finalizers"] {
                if let Some(value) = meta.get(field) {
                    stored["metadata"][field] = value.clone();
                }
            }
        }
        self.patches.lock().unwrap().push(apply_doc.clone());
        ResourceObject::from_document(stored.clone())
    }
}

#[derive(Default)]
struct MemoryRouter {
    collections: Mutex<HashMap<(String, Option<String>), Arc<MemoryCollection>>>,
    latency: Option<Duration>,
}

impl MemoryRouter {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    fn collection(&self, key: &str, namespace: Option<&str>) -> Arc<MemoryCollection> {
        let mut map = self.collections.lock().unwrap();
        map.entry((key.to_string(), namespace.map(str::to_string)))
            .or_insert_with(|| {
                Arc::new(MemoryCollection {
                    latency: self.latency,
                    ..Default::default()
                })
            })
            .clone()
    }
}

impl CollectionRouter for MemoryRouter {
    fn route(
        &self,
        collection: &CollectionRef,
        scope: Scope,
        namespace: Option<&str>,
    ) -> Result<Arc<dyn Collection>, Error> {
        let bound = bind_namespace(scope, namespace)?;
        Ok(self.collection(&collection.key(), bound))
    }
}

fn catalog() -> ResourceCatalog {
    ResourceCatalog::new(vec![
        CatalogEntry {
            group: String::new(),
            version: "v1".into(),
            kind: "Pod".into(),
            resource: "pods".into(),
            namespaced: true,
        },
        CatalogEntry {
            group: String::new(),
            version: "v1".into(),
            kind: "Namespace".into(),
            resource: "namespaces".into(),
            namespaced: false,
        },
    ])
}

fn opts() -> EngineOptions {
    EngineOptions {
        field_manager: "konverge".into(),
        step_timeout: Duration::from_secs(10),
        ns_override: None,
    }
}

const POD: &str = "\
apiVersion: v1
kind: Pod
metadata:
  name: busybox-sleep
  namespace: sre-test
spec:
  containers:
  - name: busybox
    image: busybox
    args:
    - sleep
    - \"1000000\"
";

#[tokio::test]
async fn missing_object_is_created() {
    let router = MemoryRouter::default();
    let outcomes = apply_manifest(POD.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].outcome, Outcome::Created));
    assert_eq!(outcomes[0].report(), "Pod sre-test/busybox-sleep created");

    let pods = router.collection("v1/pods", Some("sre-test"));
    assert!(pods.objects.lock().unwrap().contains_key("busybox-sleep"));
}

#[tokio::test]
async fn reapplying_identical_manifest_is_applied_without_drift() {
    let router = MemoryRouter::default();
    let first = apply_manifest(POD.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert!(matches!(first[0].outcome, Outcome::Created));

    let second = apply_manifest(POD.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert!(matches!(second[0].outcome, Outcome::Applied));
    assert_eq!(second[0].report(), "Pod sre-test/busybox-sleep applied");

    let third = apply_manifest(POD.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert!(matches!(third[0].outcome, Outcome::Applied));
}

#[tokio::test]
async fn metadata_only_update_patches_without_spec() {
    let router = MemoryRouter::default();
    apply_manifest(POD.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();

    let relabeled = POD.replace(
        "metadata:\n  name: busybox-sleep",
        "metadata:\n  name: busybox-sleep\n  labels:\n    foo: bar",
    );
    let outcomes = apply_manifest(relabeled.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert!(matches!(outcomes[0].outcome, Outcome::Applied));

    let pods = router.collection("v1/pods", Some("sre-test"));
    let patches = pods.patches.lock().unwrap();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0]["metadata"]["labels"]["foo"], "bar");
    assert!(patches[0].get("spec").is_none());

    let objects = pods.objects.lock().unwrap();
    assert_eq!(
        objects["busybox-sleep"]["metadata"]["labels"]["foo"],
        "bar"
    );
}

#[tokio::test]
async fn spec_drift_fails_without_issuing_a_patch() {
    let router = MemoryRouter::default();
    apply_manifest(POD.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();

    let drifted = POD.replace("- sleep", "- nap");
    let outcomes = apply_manifest(drifted.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert!(matches!(
        outcomes[0].outcome,
        Outcome::Failed(Error::SpecImmutable(_))
    ));

    let pods = router.collection("v1/pods", Some("sre-test"));
    assert!(pods.patches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_kind_fails_independently_of_other_documents() {
    let manifest = format!(
        "apiVersion: widgets.io/v1\nkind: Widget\nmetadata:\n  name: w\n---\n{}",
        POD
    );
    let router = MemoryRouter::default();
    let outcomes = apply_manifest(manifest.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(
        outcomes[0].outcome,
        Outcome::Failed(Error::Mapping(_))
    ));
    assert!(matches!(outcomes[1].outcome, Outcome::Created));
}

#[tokio::test]
async fn document_missing_name_fails_after_earlier_documents_succeed() {
    let manifest = format!("{}---\napiVersion: v1\nkind: Pod\nmetadata:\n  namespace: sre-test\n", POD);
    let router = MemoryRouter::default();
    let outcomes = apply_manifest(manifest.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[0].outcome, Outcome::Created));
    assert!(matches!(
        outcomes[1].outcome,
        Outcome::Failed(Error::Validation(_))
    ));
    assert_eq!(outcomes[1].target(), "document 2");
}

#[tokio::test]
async fn namespaced_kind_without_namespace_is_a_validation_failure() {
    let manifest = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\nspec: {}\n";
    let router = MemoryRouter::default();
    let outcomes = apply_manifest(manifest.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert!(matches!(
        outcomes[0].outcome,
        Outcome::Failed(Error::Validation(_))
    ));
}

#[tokio::test]
async fn namespace_override_fills_only_missing_namespaces() {
    let manifest = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\nspec: {}\n";
    let router = MemoryRouter::default();
    let mut options = opts();
    options.ns_override = Some("fallback".into());
    let outcomes = apply_manifest(manifest.as_bytes(), &catalog(), &router, &options)
        .await
        .unwrap();
    assert!(matches!(outcomes[0].outcome, Outcome::Created));
    assert_eq!(outcomes[0].namespace.as_deref(), Some("fallback"));

    // explicit namespace wins over the override
    let outcomes = apply_manifest(POD.as_bytes(), &catalog(), &router, &options)
        .await
        .unwrap();
    assert_eq!(outcomes[0].namespace.as_deref(), Some("sre-test"));
}

#[tokio::test]
async fn cluster_scoped_kind_ignores_namespace() {
    let manifest = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: sre-test\n";
    let router = MemoryRouter::default();
    let outcomes = apply_manifest(manifest.as_bytes(), &catalog(), &router, &opts())
        .await
        .unwrap();
    assert!(matches!(outcomes[0].outcome, Outcome::Created));
    assert_eq!(outcomes[0].report(), "Namespace sre-test created");

    let namespaces = router.collection("v1/namespaces", None);
    assert!(namespaces.objects.lock().unwrap().contains_key("sre-test"));
}

#[tokio::test]
async fn step_timeout_fails_the_object_and_processing_continues() {
    let manifest = format!(
        "{}---\napiVersion: v1\nkind: Pod\nmetadata:\n  name: second\n  namespace: sre-test\nspec: {{}}\n",
        POD
    );
    let router = MemoryRouter::with_latency(Duration::from_secs(60));
    let mut options = opts();
    options.step_timeout = Duration::from_secs(1);
    let outcomes = apply_manifest(manifest.as_bytes(), &catalog(), &router, &options)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert!(matches!(outcome.outcome, Outcome::Failed(Error::Timeout(_))));
    }
}

#[tokio::test]
async fn stream_level_decode_failure_is_the_only_invocation_error() {
    let router = MemoryRouter::default();
    let err = apply_manifest(b"kind: [unclosed", &catalog(), &router, &opts())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}
