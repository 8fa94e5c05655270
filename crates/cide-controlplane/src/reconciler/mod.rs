//! Resource reconciler
//!
//! Applies rendered manifests to the cluster one document at a time, in
//! input order. Each document is created, or, if it already exists, read
//! back and updated with the live `resourceVersion`. A failing document is
//! recorded in the [`ApplyReport`] and does not undo or stop the others.

mod manifest;
mod mapper;

pub use manifest::{render, ManifestTemplate, RenderedManifest};
pub use mapper::RestMapper;

use std::sync::Arc;

use cide_core::error::{ClusterError, ReconcileError};
use cide_core::traits::{ApiResource, ClusterApi, GroupVersionKind, ResourceObject};

/// Kinds that can be deleted by name, with their resource types
const DELETABLE_KINDS: &[(&str, &str, &str, &str)] = &[
    // (kind, group, version, plural)
    ("Pod", "", "v1", "pods"),
    ("Service", "", "v1", "services"),
    ("ConfigMap", "", "v1", "configmaps"),
    ("Secret", "", "v1", "secrets"),
    ("PersistentVolumeClaim", "", "v1", "persistentvolumeclaims"),
    ("Deployment", "apps", "v1", "deployments"),
    ("StatefulSet", "apps", "v1", "statefulsets"),
    ("Job", "batch", "v1", "jobs"),
    ("Ingress", "networking.k8s.io", "v1", "ingresses"),
];

/// Look up a deletable kind, case-insensitively
pub fn deletable_kind(kind: &str) -> Option<ApiResource> {
    DELETABLE_KINDS
        .iter()
        .find(|(k, ..)| k.eq_ignore_ascii_case(kind))
        .map(|(k, group, version, plural)| ApiResource::namespaced(group, version, k, plural))
}

/// What applying one document did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Updated,
}

/// Outcome of a single document
#[derive(Debug)]
pub struct DocumentOutcome {
    /// Manifest the document came from
    pub source: String,
    /// Position of the document within its manifest
    pub index: usize,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub result: Result<ApplyAction, ReconcileError>,
}

impl DocumentOutcome {
    fn describe(&self) -> String {
        match (&self.kind, &self.name) {
            (Some(kind), Some(name)) => format!("{} {}", kind, name),
            _ => format!("{} document {}", self.source, self.index),
        }
    }
}

/// Per-document results of an apply, in input order
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<DocumentOutcome>,
}

impl ApplyReport {
    /// Whether every document applied
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Outcomes that failed
    pub fn failures(&self) -> impl Iterator<Item = &DocumentOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// One line describing every failure, if any
    pub fn error_summary(&self) -> Option<String> {
        let failures: Vec<String> = self
            .failures()
            .filter_map(|o| {
                o.result
                    .as_ref()
                    .err()
                    .map(|e| format!("{}: {}", o.describe(), e))
            })
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        }
    }
}

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Applies and deletes workspace resources
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    mapper: Arc<RestMapper>,
    namespace: String,
}

impl Reconciler {
    /// Create a reconciler over a cluster client and a shared mapping cache
    pub fn new(cluster: Arc<dyn ClusterApi>, mapper: Arc<RestMapper>, namespace: &str) -> Self {
        Self {
            cluster,
            mapper,
            namespace: namespace.to_string(),
        }
    }

    /// Default namespace for documents that don't name one
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Apply every document of every manifest, strictly in order
    pub async fn apply(&self, manifests: &[RenderedManifest]) -> ApplyReport {
        let mut report = ApplyReport::default();

        for manifest in manifests {
            for (index, document) in manifest.documents().into_iter().enumerate() {
                let (kind, name) = match &document {
                    Ok(object) => (
                        object.kind().map(str::to_string),
                        object.name().map(str::to_string),
                    ),
                    Err(_) => (None, None),
                };

                let result = match document {
                    Ok(object) => self.apply_document(object).await,
                    Err(e) => Err(e),
                };

                let outcome = DocumentOutcome {
                    source: manifest.source.clone(),
                    index,
                    kind,
                    name,
                    result,
                };
                match &outcome.result {
                    Ok(action) => {
                        tracing::debug!("{:?} {} from {}", action, outcome.describe(), manifest.source)
                    }
                    Err(e) => tracing::warn!(
                        "Failed to apply {} from {}: {}",
                        outcome.describe(),
                        manifest.source,
                        e
                    ),
                }
                report.outcomes.push(outcome);
            }
        }

        report
    }

    async fn apply_document(&self, object: ResourceObject) -> Result<ApplyAction, ReconcileError> {
        let api_version = object
            .api_version()
            .ok_or(ReconcileError::MissingField("apiVersion"))?;
        let kind = object.kind().ok_or(ReconcileError::MissingField("kind"))?;
        let name = object
            .name()
            .ok_or(ReconcileError::MissingField("metadata.name"))?
            .to_string();

        let gvk = GroupVersionKind::from_api_version(api_version, kind);
        let resource = self.mapper.resolve(&gvk, self.cluster.as_ref()).await?;

        let namespace = object
            .namespace()
            .unwrap_or(self.namespace.as_str())
            .to_string();
        let mut desired = object.clone();
        if resource.namespaced {
            desired.set_namespace(&namespace);
        }

        match self.cluster.create(&resource, &namespace, &desired).await {
            Ok(_) => Ok(ApplyAction::Created),
            Err(e) if e.is_already_exists() => {
                self.update_existing(&resource, &namespace, &name, desired)
                    .await
            }
            Err(source) => Err(cluster_error("create", &resource, &name, source)),
        }
    }

    /// Read-modify-write with a single retry on conflict
    async fn update_existing(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        mut desired: ResourceObject,
    ) -> Result<ApplyAction, ReconcileError> {
        let mut retried = false;
        loop {
            let current = self
                .cluster
                .get(resource, namespace, name)
                .await
                .map_err(|source| cluster_error("get", resource, name, source))?;

            let version = current
                .resource_version()
                .ok_or(ReconcileError::MissingField("metadata.resourceVersion"))?;
            desired.set_resource_version(version);

            match self.cluster.update(resource, namespace, &desired).await {
                Ok(_) => return Ok(ApplyAction::Updated),
                Err(e) if e.is_conflict() && !retried => {
                    tracing::debug!(
                        "Conflict updating {} {}, retrying with a fresh read",
                        resource.gvk.kind,
                        name
                    );
                    retried = true;
                }
                Err(source) => return Err(cluster_error("update", resource, name, source)),
            }
        }
    }

    /// Delete a resource by kind and name
    ///
    /// An absent resource is reported as [`DeleteOutcome::AlreadyAbsent`].
    pub async fn delete(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<DeleteOutcome, ReconcileError> {
        let resource =
            deletable_kind(kind).ok_or_else(|| ReconcileError::UnknownKind(kind.to_string()))?;

        match self.cluster.delete(&resource, namespace, name).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.is_not_found() => {
                tracing::debug!("{} {} already absent", resource.gvk.kind, name);
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(source) => Err(cluster_error("delete", &resource, name, source)),
        }
    }
}

fn cluster_error(
    action: &'static str,
    resource: &ApiResource,
    name: &str,
    source: ClusterError,
) -> ReconcileError {
    ReconcileError::Cluster {
        action,
        kind: resource.gvk.kind.clone(),
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;

    const POD: &str = "apiVersion: v1
kind: Pod
metadata:
  name: shell-abc
  labels:
    workspace: abc
spec:
  containers:
    - name: shell
      image: busybox
";

    fn setup() -> (Arc<MemoryCluster>, Reconciler) {
        let cluster = Arc::new(MemoryCluster::new());
        let reconciler = Reconciler::new(cluster.clone(), Arc::new(RestMapper::new()), "cloud-ide");
        (cluster, reconciler)
    }

    fn version_of(cluster: &MemoryCluster) -> u64 {
        cluster
            .object("pods", "cloud-ide", "shell-abc")
            .and_then(|o| o.resource_version().map(str::to_string))
            .and_then(|v| v.parse().ok())
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let (cluster, reconciler) = setup();
        let manifests = [RenderedManifest::new("shell-pod.yaml", POD)];

        let first = reconciler.apply(&manifests).await;
        assert!(first.is_success());
        assert!(matches!(first.outcomes[0].result, Ok(ApplyAction::Created)));
        let v1 = version_of(&cluster);

        let second = reconciler.apply(&manifests).await;
        assert!(second.is_success());
        assert!(matches!(second.outcomes[0].result, Ok(ApplyAction::Updated)));
        assert!(version_of(&cluster) > v1);
        assert_eq!(cluster.object_count(), 1);
    }

    #[tokio::test]
    async fn test_single_conflict_is_retried() {
        let (cluster, reconciler) = setup();
        let manifests = [RenderedManifest::new("shell-pod.yaml", POD)];
        reconciler.apply(&manifests).await;

        cluster.inject_conflicts(1);
        let report = reconciler.apply(&manifests).await;
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_repeated_conflict_surfaces() {
        let (cluster, reconciler) = setup();
        let manifests = [RenderedManifest::new("shell-pod.yaml", POD)];
        reconciler.apply(&manifests).await;

        cluster.inject_conflicts(2);
        let report = reconciler.apply(&manifests).await;
        let err = report.outcomes[0].result.as_ref().unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Cluster { action: "update", source, .. } if source.is_conflict()
        ));
    }

    #[tokio::test]
    async fn test_failed_document_does_not_stop_later_ones() {
        let (cluster, reconciler) = setup();
        let gadget = "apiVersion: example.com/v1\nkind: Gadget\nmetadata:\n  name: g\n";
        let manifests = [
            RenderedManifest::new("gadget.yaml", gadget),
            RenderedManifest::new("no-name.yaml", "apiVersion: v1\nkind: Pod\nmetadata: {}\n"),
            RenderedManifest::new("shell-pod.yaml", POD),
        ];

        let report = reconciler.apply(&manifests).await;
        assert_eq!(report.outcomes.len(), 3);
        assert!(matches!(
            report.outcomes[0].result,
            Err(ReconcileError::UnresolvedKind { .. })
        ));
        assert!(matches!(
            report.outcomes[1].result,
            Err(ReconcileError::MissingField("metadata.name"))
        ));
        assert!(report.outcomes[2].result.is_ok());
        assert!(cluster.object("pods", "cloud-ide", "shell-abc").is_some());

        let summary = report.error_summary().unwrap();
        assert!(summary.contains("Gadget g"));
    }

    #[tokio::test]
    async fn test_delete_absent_is_success() {
        let (_cluster, reconciler) = setup();
        let outcome = reconciler.delete("pod", "shell-ghost", "cloud-ide").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_delete_unknown_kind() {
        let (_cluster, reconciler) = setup();
        let err = reconciler.delete("Gadget", "g", "cloud-ide").await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownKind(_)));
    }

    #[test]
    fn test_every_derived_kind_is_deletable() {
        for kind in cide_core::ResourceNames::DERIVED_KINDS {
            assert!(deletable_kind(kind).is_some(), "{} has no delete mapping", kind);
        }
    }

    #[tokio::test]
    async fn test_delete_existing() {
        let (cluster, reconciler) = setup();
        reconciler
            .apply(&[RenderedManifest::new("shell-pod.yaml", POD)])
            .await;
        let outcome = reconciler.delete("Pod", "shell-abc", "cloud-ide").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(cluster.object_count(), 0);
    }
}
