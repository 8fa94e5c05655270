//! Filesystem template provider

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use cide_core::error::TemplateError;
use cide_core::traits::TemplateProvider;
use cide_core::{ProjectType, WorkspaceId};

/// Copies project skeletons from `<templates_dir>/<prefix>/` into `<cache_dir>/<id>/`
pub struct FsTemplateProvider {
    templates_dir: PathBuf,
    cache_dir: PathBuf,
}

impl FsTemplateProvider {
    pub fn new(templates_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Directory a workspace's files are materialized into
    pub fn workspace_dir(&self, workspace: &WorkspaceId) -> PathBuf {
        self.cache_dir.join(workspace.as_str())
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<usize, TemplateError> {
    let copy_err = |source: io::Error| TemplateError::Copy {
        path: dest.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dest).map_err(copy_err)?;
    let mut copied = 0;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| copy_err(io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| copy_err(io::Error::other(e.to_string())))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(copy_err)?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(copy_err)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[async_trait]
impl TemplateProvider for FsTemplateProvider {
    async fn fetch(
        &self,
        project: ProjectType,
        workspace: &WorkspaceId,
    ) -> Result<PathBuf, TemplateError> {
        let source = self.templates_dir.join(project.template_prefix());
        if !source.is_dir() {
            return Err(TemplateError::NotFound(source));
        }
        let dest = self.workspace_dir(workspace);

        let copied = {
            let source = source.clone();
            let target = dest.clone();
            tokio::task::spawn_blocking(move || copy_tree(&source, &target))
                .await
                .map_err(|e| TemplateError::Copy {
                    path: dest.clone(),
                    source: io::Error::other(e.to_string()),
                })??
        };

        tracing::info!(
            "Copied {} template files from {:?} into {:?}",
            copied,
            source,
            dest
        );
        Ok(dest)
    }
}
