//! Waiting for a workspace pod to become usable

use std::sync::Arc;
use std::time::Duration;

use cide_core::error::ReadinessError;
use cide_core::traits::{ClusterApi, PodSnapshot, WatchEvent};

/// Blocks until a pod under a label selector is Running and Ready
pub struct ReadinessWaiter {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
}

impl ReadinessWaiter {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
        }
    }

    /// Wait for a ready pod matching `selector`
    ///
    /// A pod that is already ready is returned without opening a watch.
    /// Otherwise the watch is held until a ready pod is seen, the timeout
    /// elapses, or the watch ends, and is released on all three paths.
    pub async fn wait_for_ready(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<PodSnapshot, ReadinessError> {
        let pods = self.cluster.list_pods(&self.namespace, selector).await?;
        if let Some(pod) = pods.into_iter().find(PodSnapshot::is_ready) {
            tracing::debug!("Pod {} already ready", pod.name);
            return Ok(pod);
        }

        let mut watch = self.cluster.watch_pods(&self.namespace, selector).await?;
        tracing::debug!("Watching for ready pod with selector {}", selector);

        let outcome = tokio::time::timeout(timeout, async {
            while let Some(event) = watch.next().await {
                match event {
                    WatchEvent::Applied(pod) if pod.is_ready() => return Ok(pod),
                    WatchEvent::Applied(pod) => {
                        tracing::debug!("Pod {} is {}", pod.name, pod.phase)
                    }
                    WatchEvent::Deleted(pod) => tracing::debug!("Pod {} deleted", pod.name),
                }
            }
            Err(ReadinessError::WatchClosed(selector.to_string()))
        })
        .await;
        watch.stop();

        match outcome {
            Ok(result) => {
                if let Ok(pod) = &result {
                    tracing::info!("Pod {} is ready", pod.name);
                }
                result
            }
            Err(_) => Err(ReadinessError::Timeout {
                selector: selector.to_string(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use cide_core::traits::{ApiResource, ResourceObject};
    use serde_json::json;

    async fn create_pod(cluster: &MemoryCluster, name: &str) {
        let pod = ResourceObject(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "labels": {"workspace": "abc"}}
        }));
        cluster
            .create(&ApiResource::namespaced("", "v1", "Pod", "pods"), "ns", &pod)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_already_ready_returns_without_watch() {
        let cluster = Arc::new(MemoryCluster::new().with_auto_ready(true));
        create_pod(&cluster, "shell-abc").await;

        let waiter = ReadinessWaiter::new(cluster.clone(), "ns");
        let pod = waiter
            .wait_for_ready("workspace=abc", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(pod.name, "shell-abc");
        assert_eq!(cluster.watches_opened(), 0);
    }

    #[tokio::test]
    async fn test_becomes_ready_while_watching() {
        let cluster = Arc::new(MemoryCluster::new());
        create_pod(&cluster, "shell-abc").await;

        let waiter = ReadinessWaiter::new(cluster.clone(), "ns");
        let flip = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                while cluster.watches_opened() == 0 {
                    tokio::task::yield_now().await;
                }
                cluster.set_pod_status("ns", "shell-abc", "Running", true);
            })
        };

        let pod = waiter
            .wait_for_ready("workspace=abc", Duration::from_secs(5))
            .await
            .unwrap();
        flip.await.unwrap();

        assert!(pod.is_ready());
        assert_eq!(cluster.watches_opened(), 1);
        assert_eq!(cluster.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_watch() {
        let cluster = Arc::new(MemoryCluster::new());
        create_pod(&cluster, "shell-abc").await;

        let waiter = ReadinessWaiter::new(cluster.clone(), "ns");
        let err = waiter
            .wait_for_ready("workspace=abc", Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::Timeout { .. }));
        assert_eq!(cluster.watches_opened(), 1);
        assert_eq!(cluster.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_closed_watch_is_distinct_from_timeout() {
        let cluster = Arc::new(MemoryCluster::new());
        create_pod(&cluster, "shell-abc").await;

        let waiter = ReadinessWaiter::new(cluster.clone(), "ns");
        let closer = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                while cluster.watches_opened() == 0 {
                    tokio::task::yield_now().await;
                }
                cluster.close_watches();
            })
        };

        let err = waiter
            .wait_for_ready("workspace=abc", Duration::from_secs(5))
            .await
            .unwrap_err();
        closer.await.unwrap();

        assert!(matches!(err, ReadinessError::WatchClosed(_)));
        assert!(err.is_retryable());
        assert_eq!(cluster.active_watches(), 0);
    }
}
