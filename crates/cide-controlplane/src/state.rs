//! Process-wide control plane state

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use cide_core::config::ControlPlaneConfig;
use cide_core::traits::{ClusterConnector, TemplateProvider};

use crate::reconciler::RestMapper;
use crate::session::WorkspaceRegistry;
use crate::templates::FsTemplateProvider;

/// State shared by every connection
pub struct ControlPlaneState {
    /// Configuration
    pub config: ControlPlaneConfig,
    /// Builds per-session cluster clients
    pub connector: Arc<dyn ClusterConnector>,
    /// Materializes project skeletons
    pub templates: Arc<dyn TemplateProvider>,
    /// Discovery cache shared by every reconciler
    pub mapper: Arc<RestMapper>,
    /// Live workspaces
    pub registry: Arc<WorkspaceRegistry>,
    /// Cancelled on process shutdown
    pub shutdown: CancellationToken,
}

impl ControlPlaneState {
    /// Create state with the filesystem template provider
    pub fn new(config: ControlPlaneConfig, connector: Arc<dyn ClusterConnector>) -> Self {
        let templates = Arc::new(FsTemplateProvider::new(
            &config.templates_dir,
            &config.cache_dir,
        ));
        Self::with_templates(config, connector, templates)
    }

    /// Create state with a custom template provider
    pub fn with_templates(
        config: ControlPlaneConfig,
        connector: Arc<dyn ClusterConnector>,
        templates: Arc<dyn TemplateProvider>,
    ) -> Self {
        Self {
            registry: Arc::new(WorkspaceRegistry::new(config.workspace_id_length)),
            config,
            connector,
            templates,
            mapper: Arc::new(RestMapper::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the workspace registry
    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }
}
