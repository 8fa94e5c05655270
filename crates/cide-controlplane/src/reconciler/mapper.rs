//! Discovery-backed kind to resource mapping

use std::collections::HashMap;
use tokio::sync::RwLock;

use cide_core::error::ReconcileError;
use cide_core::traits::{ApiResource, ClusterApi, GroupVersionKind};

/// Cache of group/version/kind to concrete resource type
///
/// Shared by every reconciler in the process. Populated lazily from
/// discovery; a lookup miss invalidates it and rediscovers exactly once.
#[derive(Default)]
pub struct RestMapper {
    cache: RwLock<Option<HashMap<GroupVersionKind, ApiResource>>>,
}

impl RestMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a GVK, rediscovering once on a miss
    pub async fn resolve(
        &self,
        gvk: &GroupVersionKind,
        discovery: &dyn ClusterApi,
    ) -> Result<ApiResource, ReconcileError> {
        if let Some(resource) = self.lookup(gvk, discovery).await? {
            return Ok(resource);
        }

        tracing::debug!("No mapping for {}, rediscovering", gvk);
        self.invalidate().await;

        self.lookup(gvk, discovery)
            .await?
            .ok_or_else(|| ReconcileError::UnresolvedKind {
                api_version: gvk.api_version(),
                kind: gvk.kind.clone(),
            })
    }

    /// Drop every cached mapping
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Whether the cache currently holds a discovery result
    pub async fn is_populated(&self) -> bool {
        self.cache.read().await.is_some()
    }

    async fn lookup(
        &self,
        gvk: &GroupVersionKind,
        discovery: &dyn ClusterApi,
    ) -> Result<Option<ApiResource>, ReconcileError> {
        {
            let cache = self.cache.read().await;
            if let Some(map) = cache.as_ref() {
                return Ok(map.get(gvk).cloned());
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have populated it while we waited for the lock
        if cache.is_none() {
            let resources = discovery
                .discover()
                .await
                .map_err(ReconcileError::Discovery)?;
            tracing::debug!("Discovered {} resource types", resources.len());
            *cache = Some(
                resources
                    .into_iter()
                    .map(|r| (r.gvk.clone(), r))
                    .collect(),
            );
        }
        Ok(cache.as_ref().and_then(|map| map.get(gvk).cloned()))
    }
}
