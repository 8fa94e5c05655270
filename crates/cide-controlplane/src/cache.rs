//! Per-workspace local file cache
//!
//! Every workspace owns `<cache_dir>/<workspaceId>/`, seeded from its
//! project template. File requests from the client operate on this copy.

use base64::Engine;
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};

use cide_core::error::CacheError;
use cide_core::WorkspaceId;

/// Node kind in a tree snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// One entry of a project tree snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub name: String,
    /// Path relative to the workspace root, `/`-separated
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

/// The cached project directory of one workspace
#[derive(Debug, Clone)]
pub struct WorkspaceCache {
    root: PathBuf,
}

fn io_err(action: &'static str) -> impl FnOnce(io::Error) -> CacheError {
    move |source| CacheError::Io { action, source }
}

impl WorkspaceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache for `workspace` under `cache_dir`
    pub fn for_workspace(cache_dir: &Path, workspace: &WorkspaceId) -> Self {
        Self::new(cache_dir.join(workspace.as_str()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join client-supplied path segments onto the root
    ///
    /// Absolute paths and `..` components are rejected, so the result
    /// always lies inside the workspace directory.
    pub fn resolve(&self, dir: &str, name: &str) -> Result<PathBuf, CacheError> {
        let mut resolved = self.root.clone();
        for part in [dir, name] {
            for component in Path::new(part).components() {
                match component {
                    Component::Normal(segment) => resolved.push(segment),
                    Component::CurDir => {}
                    Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                        return Err(CacheError::InvalidPath(
                            Path::new(dir).join(name).display().to_string(),
                        ))
                    }
                }
            }
        }
        Ok(resolved)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    async fn require_file(&self, path: &Path) -> Result<(), CacheError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(CacheError::NotFound(self.relative(path))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(self.relative(path)))
            }
            Err(e) => Err(io_err("Error reading file")(e)),
        }
    }

    /// Create an empty file; an existing file is left untouched
    pub async fn create_file(&self, dir: &str, name: &str) -> Result<(), CacheError> {
        let path = self.resolve(dir, name)?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err("Error creating file"))?;
        tracing::debug!("Created file {:?}", path);
        Ok(())
    }

    /// Read a whole file as text
    pub async fn read_file(&self, dir: &str, name: &str) -> Result<String, CacheError> {
        let path = self.resolve(dir, name)?;
        self.require_file(&path).await?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(io_err("Error reading file"))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Replace line `line_number` (1-based) with the base64-decoded `encoded`
    ///
    /// Lines are split on the file's own separator: `\r\n` if the file
    /// contains one, `\n` otherwise.
    pub async fn update_line(
        &self,
        dir: &str,
        name: &str,
        line_number: usize,
        encoded: &str,
    ) -> Result<(), CacheError> {
        let path = self.resolve(dir, name)?;
        self.require_file(&path).await?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(io_err("Error reading file"))?;

        let separator = if content.contains("\r\n") { "\r\n" } else { "\n" };
        let mut lines: Vec<&str> = content.split(separator).collect();
        if line_number == 0 || line_number > lines.len() {
            return Err(CacheError::LineOutOfRange);
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CacheError::Decode(e.to_string()))?;
        let replacement = String::from_utf8_lossy(&decoded);
        lines[line_number - 1] = &*replacement;

        tokio::fs::write(&path, lines.join(separator))
            .await
            .map_err(io_err("Error writing file"))?;
        Ok(())
    }

    pub async fn delete_file(&self, dir: &str, name: &str) -> Result<(), CacheError> {
        let path = self.resolve(dir, name)?;
        self.require_file(&path).await?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(io_err("Error deleting file"))
    }

    /// Create a folder and any missing parents
    pub async fn create_folder(&self, dir: &str, name: &str) -> Result<(), CacheError> {
        let path = self.resolve(dir, name)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(io_err("Error creating folder"))
    }

    /// Remove a folder and everything below it
    pub async fn delete_folder(&self, dir: &str) -> Result<(), CacheError> {
        let path = self.resolve(dir, "")?;
        if path == self.root {
            return Err(CacheError::InvalidPath(dir.to_string()));
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(self.relative(&path)))
            }
            Err(e) => Err(io_err("Error deleting folder")(e)),
        }
    }

    /// Snapshot the project tree
    pub async fn tree(&self) -> Result<TreeNode, CacheError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || build_tree(&root, &root))
            .await
            .map_err(|e| io_err("Error reading tree")(io::Error::other(e.to_string())))?
            .map_err(io_err("Error reading tree"))
    }

    /// Remove the whole workspace directory; a missing directory is fine
    pub async fn purge(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                tracing::debug!("Purged cache {:?}", self.root);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("Error purging cache")(e)),
        }
    }
}

/// Create the directory every workspace cache lives under
pub async fn prepare_cache_dir(cache_dir: &Path) -> Result<(), CacheError> {
    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(io_err("Error creating cache directory"))?;
    tracing::debug!("Cache directory ready at {:?}", cache_dir);
    Ok(())
}

fn build_tree(root: &Path, path: &Path) -> io::Result<TreeNode> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    if !path.is_dir() {
        return Ok(TreeNode {
            name,
            path: relative,
            kind: NodeKind::File,
            children: None,
        });
    }

    let mut children = Vec::new();
    for entry in std::fs::read_dir(path)? {
        children.push(build_tree(root, &entry?.path())?);
    }
    children.sort_by(|a, b| {
        (a.kind != NodeKind::Folder, &a.name).cmp(&(b.kind != NodeKind::Folder, &b.name))
    });

    Ok(TreeNode {
        name,
        path: relative,
        kind: NodeKind::Folder,
        children: Some(children),
    })
}
