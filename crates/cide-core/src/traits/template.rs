//! Template provider trait

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::TemplateError;
use crate::types::{ProjectType, WorkspaceId};

/// Materializes a project skeleton for a new workspace
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    /// Populate the workspace's local directory and return its path
    async fn fetch(
        &self,
        project: ProjectType,
        workspace: &WorkspaceId,
    ) -> Result<PathBuf, TemplateError>;
}
