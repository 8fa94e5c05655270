//! Workspace teardown
//!
//! Cleanup is best effort: every resource deletion is attempted, the cache
//! is purged, and the id is released even if earlier steps failed. Failures
//! are logged and collected into the report.

use serde::Serialize;

use cide_core::config::ResourceTemplate;
use cide_core::WorkspaceState;

use super::registry::{WorkspaceHandle, WorkspaceRegistry};
use crate::cache::WorkspaceCache;
use crate::reconciler::{DeleteOutcome, Reconciler};

/// What a cleanup did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// `false` when another caller had already claimed the cleanup
    pub performed: bool,
    pub deleted: Vec<String>,
    pub already_absent: Vec<String>,
    pub failures: Vec<String>,
}

impl CleanupReport {
    fn skipped() -> Self {
        Self::default()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Tear a workspace down
///
/// Only the first caller for a given workspace does any work; later calls
/// return a report with `performed == false`. Resources are deleted in the
/// reverse of their apply order.
pub async fn cleanup_workspace(
    handle: &WorkspaceHandle,
    reconciler: Option<&Reconciler>,
    resources: &[ResourceTemplate],
    cache: &WorkspaceCache,
    registry: &WorkspaceRegistry,
) -> CleanupReport {
    if !handle.begin_termination() {
        tracing::debug!("Cleanup of workspace {} already claimed", handle.id);
        return CleanupReport::skipped();
    }

    tracing::info!("Cleaning up workspace {}", handle.id);
    let mut report = CleanupReport {
        performed: true,
        ..Default::default()
    };

    match reconciler {
        Some(reconciler) => {
            for resource in resources.iter().rev() {
                let Some(name) = handle.names.name_for_kind(&resource.kind) else {
                    tracing::warn!(
                        "No derived name for {} ({}), skipping",
                        resource.kind,
                        resource.name
                    );
                    report
                        .failures
                        .push(format!("{}: no derived resource name", resource.kind));
                    continue;
                };
                let label = format!("{} {}", resource.kind, name);

                match reconciler
                    .delete(&resource.kind, name, reconciler.namespace())
                    .await
                {
                    Ok(DeleteOutcome::Deleted) => {
                        tracing::debug!("Deleted {}", label);
                        report.deleted.push(label);
                    }
                    Ok(DeleteOutcome::AlreadyAbsent) => report.already_absent.push(label),
                    Err(e) => {
                        tracing::warn!("Failed to delete {}: {}", label, e);
                        report.failures.push(e.to_string());
                    }
                }
            }
        }
        None => tracing::debug!("No cluster client for workspace {}, skipping deletes", handle.id),
    }

    if let Err(e) = cache.purge().await {
        tracing::warn!("Failed to purge cache of workspace {}: {}", handle.id, e);
        report.failures.push(e.to_string());
    }

    registry.release(&handle.id);
    handle.transition(WorkspaceState::Terminated);

    if report.is_clean() {
        tracing::info!("Workspace {} cleaned up", handle.id);
    } else {
        tracing::warn!(
            "Workspace {} cleaned up with {} failures",
            handle.id,
            report.failures.len()
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::reconciler::{RenderedManifest, RestMapper};
    use cide_core::traits::ClusterApi;
    use cide_core::ProjectType;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn react_resources() -> Vec<ResourceTemplate> {
        vec![
            ResourceTemplate::new("shellPod", "Pod", "shell-pod.yaml"),
            ResourceTemplate::new("service", "Service", "service.yaml"),
            ResourceTemplate::new("ingress", "Ingress", "ingress.yaml"),
        ]
    }

    async fn provisioned(
        cluster: &Arc<MemoryCluster>,
        registry: &WorkspaceRegistry,
    ) -> (Arc<WorkspaceHandle>, Reconciler) {
        let handle = registry.reserve(ProjectType::React, &CancellationToken::new());
        let api: Arc<dyn ClusterApi> = cluster.clone();
        let reconciler = Reconciler::new(api, Arc::new(RestMapper::new()), "ns");

        let manifest = RenderedManifest::new(
            "all.yaml",
            format!(
                "apiVersion: v1\nkind: Pod\nmetadata:\n  name: {}\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: {}\n---\napiVersion: networking.k8s.io/v1\nkind: Ingress\nmetadata:\n  name: {}\n",
                handle.names.pod, handle.names.service, handle.names.ingress
            ),
        );
        assert!(reconciler.apply(&[manifest]).await.is_success());
        handle.transition(WorkspaceState::Provisioning);
        handle.transition(WorkspaceState::Ready);
        (handle, reconciler)
    }

    #[tokio::test]
    async fn test_cleanup_deletes_in_reverse_and_is_idempotent() {
        let cluster = Arc::new(MemoryCluster::new());
        let registry = WorkspaceRegistry::new(10);
        let (handle, reconciler) = provisioned(&cluster, &registry).await;

        let dir = tempfile::tempdir().unwrap();
        let cache = WorkspaceCache::for_workspace(dir.path(), &handle.id);
        std::fs::create_dir_all(cache.root()).unwrap();

        let report =
            cleanup_workspace(&handle, Some(&reconciler), &react_resources(), &cache, &registry)
                .await;
        assert!(report.performed);
        assert!(report.is_clean());
        assert_eq!(report.deleted.len(), 3);
        assert!(report.deleted[0].starts_with("Ingress"));
        assert_eq!(cluster.object_count(), 0);
        assert!(!cache.root().exists());
        assert!(registry.is_empty());
        assert_eq!(handle.state(), WorkspaceState::Terminated);

        let again =
            cleanup_workspace(&handle, Some(&reconciler), &react_resources(), &cache, &registry)
                .await;
        assert!(!again.performed);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_stop_cleanup() {
        let cluster = Arc::new(MemoryCluster::new());
        let registry = WorkspaceRegistry::new(10);
        let (handle, reconciler) = provisioned(&cluster, &registry).await;
        cluster.fail_deletes("Service");

        let dir = tempfile::tempdir().unwrap();
        let cache = WorkspaceCache::for_workspace(dir.path(), &handle.id);

        let report =
            cleanup_workspace(&handle, Some(&reconciler), &react_resources(), &cache, &registry)
                .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(cluster.object_count(), 1);
        assert_eq!(handle.state(), WorkspaceState::Terminated);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_absent_resources_count_as_success() {
        let cluster = Arc::new(MemoryCluster::new());
        let registry = WorkspaceRegistry::new(10);
        let handle = registry.reserve(ProjectType::React, &CancellationToken::new());
        let api: Arc<dyn ClusterApi> = cluster.clone();
        let reconciler = Reconciler::new(api, Arc::new(RestMapper::new()), "ns");

        let dir = tempfile::tempdir().unwrap();
        let cache = WorkspaceCache::for_workspace(dir.path(), &handle.id);

        let report =
            cleanup_workspace(&handle, Some(&reconciler), &react_resources(), &cache, &registry)
                .await;
        assert!(report.is_clean());
        assert_eq!(report.already_absent.len(), 3);
        assert_eq!(handle.state(), WorkspaceState::Terminated);
    }
}
