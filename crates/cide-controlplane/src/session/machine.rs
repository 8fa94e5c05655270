//! Per-connection session
//!
//! A session owns at most one workspace at a time. Requests are dispatched
//! by type to exactly one handler; every outcome, including decode errors
//! and unknown types, becomes a [`Response`]. Handlers and the disconnect
//! path serialize on the session lock, and the disconnect path cancels the
//! session token first so a provisioning handler gives the lock up early.

use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use cide_core::config::ResourceTemplate;
use cide_core::error::{CacheError, ReadinessError, SessionError, TemplateError};
use cide_core::traits::{ClusterApi, PodSnapshot};
use cide_core::{ProjectType, WorkspaceState};
use cide_protocol::{
    CreateFolderPayload, DeleteFolderPayload, FilePayload, InitProjectPayload, ProtocolError,
    Request, RequestTerminalPayload, RequestType, Response, UpdateFilePayload,
};

use super::cleanup::{cleanup_workspace, CleanupReport};
use super::registry::WorkspaceHandle;
use crate::cache::{TreeNode, WorkspaceCache};
use crate::readiness::ReadinessWaiter;
use crate::reconciler::{ManifestTemplate, Reconciler};
use crate::state::ControlPlaneState;
use crate::terminal::terminal_path;

/// Why provisioning stopped
#[derive(Debug, Error)]
enum ProvisionError {
    #[error("Error fetching template: {0}")]
    Template(#[from] TemplateError),

    #[error("Error applying manifests: {0}")]
    Apply(String),

    #[error("Error waiting for pod: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("Error reading project tree: {0}")]
    Tree(#[from] CacheError),

    #[error("{0}")]
    Cancelled(SessionError),
}

/// The workspace bound to a session
struct ActiveWorkspace {
    handle: Arc<WorkspaceHandle>,
    cache: WorkspaceCache,
    resources: Vec<ResourceTemplate>,
}

#[derive(Default)]
struct SessionInner {
    cluster: Option<Arc<dyn ClusterApi>>,
    workspace: Option<ActiveWorkspace>,
}

/// One client connection's view of the control plane
pub struct Session {
    state: Arc<ControlPlaneState>,
    inner: Mutex<SessionInner>,
    closed: CancellationToken,
}

fn cache_failure(err: CacheError) -> Response {
    let message = match err {
        CacheError::InvalidPath(path) => {
            ProtocolError::Validation(format!("invalid path '{}'", path)).to_string()
        }
        other => other.to_string(),
    };
    tracing::error!("{}", message);
    Response::failure(message)
}

fn session_failure(err: SessionError) -> Response {
    tracing::error!("{}", err);
    Response::failure(err.to_string())
}

impl Session {
    pub fn new(state: Arc<ControlPlaneState>) -> Self {
        let closed = state.shutdown.child_token();
        Self {
            state,
            inner: Mutex::new(SessionInner::default()),
            closed,
        }
    }

    /// Token cancelled once the session is closing
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Id and state of the bound workspace, if any
    pub async fn workspace(&self) -> Option<(cide_core::WorkspaceId, WorkspaceState)> {
        let inner = self.inner.lock().await;
        inner
            .workspace
            .as_ref()
            .map(|ws| (ws.handle.id.clone(), ws.handle.state()))
    }

    /// Decode a raw text frame and handle it
    pub async fn handle(&self, raw: &str) -> Response {
        match Request::decode(raw) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                tracing::error!("{}", e);
                e.into()
            }
        }
    }

    /// Dispatch a decoded request to its handler
    pub async fn handle_request(&self, request: Request) -> Response {
        let Some(kind) = request.request_type() else {
            tracing::warn!("Unknown message type: {}", request.kind);
            return Response::failure(format!("Unknown message type: {}", request.kind));
        };
        tracing::debug!("Handling {}", kind);

        let result = match kind {
            RequestType::InitProject => self.init_project(&request).await,
            RequestType::CreateFile => self.create_file(&request).await,
            RequestType::GetFile => self.get_file(&request).await,
            RequestType::UpdateFile => self.update_file(&request).await,
            RequestType::DeleteFile => self.delete_file(&request).await,
            RequestType::CreateFolder => self.create_folder(&request).await,
            RequestType::DeleteFolder => self.delete_folder(&request).await,
            RequestType::RequestTerminal => self.request_terminal(&request).await,
            RequestType::GetTree => self.get_tree().await,
            RequestType::StopWorkspace => self.stop().await,
        };

        result.unwrap_or_else(|e| {
            tracing::error!("{}", e);
            e.into()
        })
    }

    /// Tear down the session's workspace after the client went away
    ///
    /// Safe to call any number of times, and concurrently with a handler.
    pub async fn close(&self) -> Option<CleanupReport> {
        self.closed.cancel();
        let inner = self.inner.lock().await;
        let report = self.cleanup(&inner).await;
        if let Some(report) = &report {
            if report.performed {
                tracing::info!("Session closed, workspace cleaned up");
            }
        }
        report
    }

    async fn cleanup(&self, inner: &SessionInner) -> Option<CleanupReport> {
        let workspace = inner.workspace.as_ref()?;
        let reconciler = inner.cluster.as_ref().map(|cluster| {
            Reconciler::new(
                Arc::clone(cluster),
                Arc::clone(&self.state.mapper),
                &self.state.config.namespace,
            )
        });
        Some(
            cleanup_workspace(
                &workspace.handle,
                reconciler.as_ref(),
                &workspace.resources,
                &workspace.cache,
                &self.state.registry,
            )
            .await,
        )
    }

    /// Run `step`, giving up if the session closes first
    async fn unless_closed<T, F>(&self, step: F) -> Result<T, ProvisionError>
    where
        F: Future<Output = Result<T, ProvisionError>>,
    {
        tokio::select! {
            result = step => result,
            _ = self.closed.cancelled() => Err(ProvisionError::Cancelled(SessionError::Cancelled)),
        }
    }

    async fn init_project(&self, request: &Request) -> Result<Response, ProtocolError> {
        let payload: InitProjectPayload = request.payload_as()?;
        let project: ProjectType = payload
            .project_type
            .parse()
            .map_err(ProtocolError::Validation)?;

        let mut inner = self.inner.lock().await;

        let existing = inner
            .workspace
            .as_ref()
            .map(|ws| (ws.handle.id.clone(), ws.handle.state()));
        if let Some((id, state)) = existing {
            match state {
                WorkspaceState::Failed => {
                    tracing::info!("Replacing failed workspace {}", id);
                    self.cleanup(&inner).await;
                }
                WorkspaceState::Terminated => {}
                _ => return Ok(session_failure(SessionError::AlreadyInitialized)),
            }
            inner.workspace = None;
        }

        let Some(template) = self.state.config.projects.get(project.as_str()).cloned() else {
            return Ok(Response::failure(format!(
                "unsupported project type: {}",
                project
            )));
        };

        let cluster = match &inner.cluster {
            Some(cluster) => Arc::clone(cluster),
            None => match self.state.connector.connect().await {
                Ok(cluster) => {
                    inner.cluster = Some(Arc::clone(&cluster));
                    cluster
                }
                Err(e) => {
                    tracing::error!("Error creating K8s client: {}", e);
                    return Ok(Response::failure(format!("Error creating K8s client: {}", e)));
                }
            },
        };

        let handle = self.state.registry.reserve(project, &self.state.shutdown);
        let cache = WorkspaceCache::for_workspace(&self.state.config.cache_dir, &handle.id);
        inner.workspace = Some(ActiveWorkspace {
            handle: Arc::clone(&handle),
            cache: cache.clone(),
            resources: template.resources.clone(),
        });
        handle.transition(WorkspaceState::Provisioning);

        match self
            .provision(&handle, &cache, &template.image, &template.resources, cluster)
            .await
        {
            Ok((pod, tree)) => {
                handle.transition(WorkspaceState::Ready);
                Ok(Response::ok_with(
                    "Project created successfully",
                    json!({
                        "workspaceId": handle.id,
                        "projectType": project,
                        "pod": pod.name,
                        "tree": tree,
                    }),
                ))
            }
            Err(e) => {
                handle.transition(WorkspaceState::Failed);
                tracing::error!("Provisioning workspace {} failed: {}", handle.id, e);
                Ok(Response::failure(e.to_string()))
            }
        }
    }

    async fn provision(
        &self,
        handle: &WorkspaceHandle,
        cache: &WorkspaceCache,
        image: &str,
        resources: &[ResourceTemplate],
        cluster: Arc<dyn ClusterApi>,
    ) -> Result<(PodSnapshot, TreeNode), ProvisionError> {
        let config = &self.state.config;

        self.unless_closed(async {
            self.state.templates.fetch(handle.project, &handle.id).await?;
            Ok::<_, ProvisionError>(())
        })
        .await?;

        let mut common = BTreeMap::new();
        common.insert("WORKSPACE_ID".to_string(), handle.id.to_string());
        common.insert("NAMESPACE".to_string(), config.namespace.clone());
        common.insert("SHELL_IMAGE".to_string(), image.to_string());
        common.insert(
            "HOST".to_string(),
            format!("{}.{}", handle.id, config.ingress_domain),
        );

        let mut manifests = Vec::with_capacity(resources.len());
        for resource in resources {
            let rendered = ManifestTemplate::new(config.manifests_dir.join(&resource.template))
                .with_variables(&common)
                .with_variables(&resource.variables)
                .render()
                .await
                .map_err(|e| ProvisionError::Apply(e.to_string()))?;
            manifests.push(rendered);
        }

        let reconciler = Reconciler::new(
            Arc::clone(&cluster),
            Arc::clone(&self.state.mapper),
            &config.namespace,
        );
        let report = self
            .unless_closed(async { Ok::<_, ProvisionError>(reconciler.apply(&manifests).await) })
            .await?;
        if let Some(summary) = report.error_summary() {
            return Err(ProvisionError::Apply(summary));
        }

        let waiter = ReadinessWaiter::new(cluster, &config.namespace);
        let pod = self
            .unless_closed(async {
                let pod = waiter
                    .wait_for_ready(&handle.names.label_selector, config.readiness_timeout)
                    .await?;
                Ok::<_, ProvisionError>(pod)
            })
            .await?;

        let tree = cache.tree().await?;
        Ok((pod, tree))
    }

    /// Cache of the bound workspace, if it may serve file requests
    async fn active_cache(&self) -> Result<WorkspaceCache, SessionError> {
        let inner = self.inner.lock().await;
        let workspace = inner.workspace.as_ref().ok_or(SessionError::NoWorkspace)?;
        let state = workspace.handle.state();
        if state.is_terminal() {
            return Err(SessionError::InvalidState(state.to_string()));
        }
        Ok(workspace.cache.clone())
    }

    async fn create_file(&self, request: &Request) -> Result<Response, ProtocolError> {
        let data: FilePayload = request.payload_as()?;
        let cache = match self.active_cache().await {
            Ok(cache) => cache,
            Err(e) => return Ok(session_failure(e)),
        };
        Ok(match cache.create_file(&data.file_path, &data.file_name).await {
            Ok(()) => Response::ok("File created successfully"),
            Err(e) => cache_failure(e),
        })
    }

    async fn get_file(&self, request: &Request) -> Result<Response, ProtocolError> {
        let data: FilePayload = request.payload_as()?;
        let cache = match self.active_cache().await {
            Ok(cache) => cache,
            Err(e) => return Ok(session_failure(e)),
        };
        Ok(match cache.read_file(&data.file_path, &data.file_name).await {
            Ok(content) => {
                Response::ok_with("File retrieved successfully", json!({ "content": content }))
            }
            Err(e) => cache_failure(e),
        })
    }

    async fn update_file(&self, request: &Request) -> Result<Response, ProtocolError> {
        let data: UpdateFilePayload = request.payload_as()?;
        let cache = match self.active_cache().await {
            Ok(cache) => cache,
            Err(e) => return Ok(session_failure(e)),
        };
        let result = cache
            .update_line(
                &data.file_path,
                &data.file_name,
                data.line_number,
                &data.line_content,
            )
            .await;
        Ok(match result {
            Ok(()) => Response::ok("File updated successfully"),
            Err(e) => cache_failure(e),
        })
    }

    async fn delete_file(&self, request: &Request) -> Result<Response, ProtocolError> {
        let data: FilePayload = request.payload_as()?;
        let cache = match self.active_cache().await {
            Ok(cache) => cache,
            Err(e) => return Ok(session_failure(e)),
        };
        Ok(match cache.delete_file(&data.file_path, &data.file_name).await {
            Ok(()) => Response::ok("File deleted successfully"),
            Err(e) => cache_failure(e),
        })
    }

    async fn create_folder(&self, request: &Request) -> Result<Response, ProtocolError> {
        let data: CreateFolderPayload = request.payload_as()?;
        let cache = match self.active_cache().await {
            Ok(cache) => cache,
            Err(e) => return Ok(session_failure(e)),
        };
        Ok(
            match cache.create_folder(&data.folder_path, &data.folder_name).await {
                Ok(()) => Response::ok("Folder created successfully"),
                Err(e) => cache_failure(e),
            },
        )
    }

    async fn delete_folder(&self, request: &Request) -> Result<Response, ProtocolError> {
        let data: DeleteFolderPayload = request.payload_as()?;
        let cache = match self.active_cache().await {
            Ok(cache) => cache,
            Err(e) => return Ok(session_failure(e)),
        };
        Ok(match cache.delete_folder(&data.folder_path).await {
            Ok(()) => Response::ok("Folder deleted successfully"),
            Err(e) => cache_failure(e),
        })
    }

    async fn get_tree(&self) -> Result<Response, ProtocolError> {
        let cache = match self.active_cache().await {
            Ok(cache) => cache,
            Err(e) => return Ok(session_failure(e)),
        };
        Ok(match cache.tree().await {
            Ok(tree) => Response::ok_with("Tree retrieved successfully", json!(tree)),
            Err(e) => cache_failure(e),
        })
    }

    async fn request_terminal(&self, request: &Request) -> Result<Response, ProtocolError> {
        let data: RequestTerminalPayload = request.payload_as()?;

        let (cluster, handle) = {
            let inner = self.inner.lock().await;
            let Some(cluster) = inner.cluster.clone() else {
                return Ok(session_failure(SessionError::ClientNotInitialized));
            };
            let Some(workspace) = inner.workspace.as_ref() else {
                return Ok(session_failure(SessionError::NoWorkspace));
            };
            (cluster, Arc::clone(&workspace.handle))
        };

        if let Some(requested) = &data.workspace_id {
            if requested != handle.id.as_str() {
                return Ok(session_failure(SessionError::WorkspaceNotFound(
                    requested.clone(),
                )));
            }
        }
        if !handle.is_ready() {
            return Ok(session_failure(SessionError::InvalidState(
                handle.state().to_string(),
            )));
        }

        let waiter = ReadinessWaiter::new(cluster, &self.state.config.namespace);
        let pod = match waiter
            .wait_for_ready(
                &handle.names.label_selector,
                self.state.config.terminal_lookup_timeout,
            )
            .await
        {
            Ok(pod) => pod,
            Err(e) => {
                tracing::error!("Error finding pod: {}", e);
                return Ok(Response::failure(format!("Error finding pod: {}", e)));
            }
        };

        Ok(Response::ok_with(
            "Terminal ready",
            json!({
                "workspaceId": handle.id,
                "pod": pod.name,
                "path": terminal_path(&pod.name, handle.id.as_str()),
            }),
        ))
    }

    async fn stop(&self) -> Result<Response, ProtocolError> {
        let inner = self.inner.lock().await;
        let Some(workspace) = inner.workspace.as_ref() else {
            return Ok(session_failure(SessionError::NoWorkspace));
        };
        let id = workspace.handle.id.clone();

        let report = self.cleanup(&inner).await.unwrap_or_default();
        Ok(Response::ok_with(
            "Workspace stopped",
            json!({
                "workspaceId": id,
                "cleanup": report,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryCluster, MemoryConnector};
    use cide_core::config::ControlPlaneConfig;
    use serde_json::Value;

    struct Fixture {
        _dirs: tempfile::TempDir,
        cluster: Arc<MemoryCluster>,
        state: Arc<ControlPlaneState>,
    }

    fn fixture(auto_ready: bool) -> Fixture {
        let dirs = tempfile::tempdir().unwrap();
        let templates = dirs.path().join("templates");
        let manifests = dirs.path().join("manifests");
        std::fs::create_dir_all(templates.join("python")).unwrap();
        std::fs::write(templates.join("python").join("main.py"), "print('hi')\r\n").unwrap();
        std::fs::create_dir_all(&manifests).unwrap();
        std::fs::write(
            manifests.join("shell-pod.yaml"),
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: shell-{{WORKSPACE_ID}}\n  namespace: {{NAMESPACE}}\n  labels:\n    workspace: {{WORKSPACE_ID}}\nspec:\n  containers:\n    - name: shell\n      image: {{SHELL_IMAGE}}\n",
        )
        .unwrap();

        let mut config = ControlPlaneConfig::default();
        config.namespace = "ide".to_string();
        config.cache_dir = dirs.path().join("cache");
        config.templates_dir = templates;
        config.manifests_dir = manifests;
        config.readiness_timeout = std::time::Duration::from_millis(200);

        let cluster = Arc::new(MemoryCluster::new().with_auto_ready(auto_ready));
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&cluster)));
        Fixture {
            _dirs: dirs,
            cluster,
            state: Arc::new(ControlPlaneState::new(config, connector)),
        }
    }

    fn init_python() -> String {
        r#"{"type":"initProject","payload":{"projectType":"python"}}"#.to_string()
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_requests() {
        let fx = fixture(true);
        let session = Session::new(Arc::clone(&fx.state));

        let resp = session.handle(r#"{"type":"launchRocket"}"#).await;
        assert!(!resp.success);
        assert_eq!(resp.message, "Unknown message type: launchRocket");

        let resp = session.handle("{nope").await;
        assert!(resp.message.starts_with("Error unmarshalling message:"));

        let resp = session
            .handle(r#"{"type":"initProject","payload":{"projectType":"cobol"}}"#)
            .await;
        assert!(resp.message.starts_with("Validation error:"));
    }

    #[tokio::test]
    async fn test_terminal_before_init() {
        let fx = fixture(true);
        let session = Session::new(Arc::clone(&fx.state));

        let resp = session.handle(r#"{"type":"requestTerminal","payload":{}}"#).await;
        assert!(!resp.success);
        assert_eq!(resp.message, "K8s client not initialized");
    }

    #[tokio::test]
    async fn test_init_renders_image_and_reports_tree() {
        let fx = fixture(true);
        let session = Session::new(Arc::clone(&fx.state));

        let resp = session.handle(&init_python()).await;
        assert!(resp.success, "{}", resp.message);
        assert_eq!(resp.message, "Project created successfully");

        let payload = resp.payload.unwrap();
        let id = payload["workspaceId"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(payload["pod"], Value::from(format!("shell-{}", id)));
        assert_eq!(payload["tree"]["children"][0]["name"], "main.py");

        let pod = fx.cluster.object("pods", "ide", &format!("shell-{}", id)).unwrap();
        assert_eq!(
            pod.0["spec"]["containers"][0]["image"],
            "ghcr.io/mudit06mah/shell-python:latest"
        );

        let again = session.handle(&init_python()).await;
        assert_eq!(again.message, "Workspace already initialized");
    }

    #[tokio::test]
    async fn test_readiness_timeout_fails_workspace() {
        let fx = fixture(false);
        let session = Session::new(Arc::clone(&fx.state));

        let resp = session.handle(&init_python()).await;
        assert!(!resp.success);
        assert!(resp.message.starts_with("Error waiting for pod:"));
        let (_, state) = session.workspace().await.unwrap();
        assert_eq!(state, WorkspaceState::Failed);
        assert_eq!(fx.cluster.active_watches(), 0);

        // a failed workspace is cleaned up before re-initializing
        let first_id = session.workspace().await.unwrap().0;
        let _ = session.handle(&init_python()).await;
        assert!(fx.state.registry.get(&first_id).is_none());
    }

    #[tokio::test]
    async fn test_missing_template_is_reported() {
        let fx = fixture(true);
        let session = Session::new(Arc::clone(&fx.state));

        let resp = session
            .handle(r#"{"type":"initProject","payload":{"projectType":"golang"}}"#)
            .await;
        assert!(resp.message.starts_with("Error fetching template:"));
    }

    #[tokio::test]
    async fn test_file_requests_need_workspace() {
        let fx = fixture(true);
        let session = Session::new(Arc::clone(&fx.state));

        let resp = session
            .handle(r#"{"type":"getFile","payload":{"fileName":"main.py","filePath":""}}"#)
            .await;
        assert_eq!(resp.message, "No workspace initialized");
    }

    #[tokio::test]
    async fn test_file_round_trip_and_path_confinement() {
        let fx = fixture(true);
        let session = Session::new(Arc::clone(&fx.state));
        assert!(session.handle(&init_python()).await.success);

        let resp = session
            .handle(r#"{"type":"updateFile","payload":{"fileName":"main.py","filePath":"","lineNumber":1,"lineContent":"cHJpbnQoJ2J5ZScp"}}"#)
            .await;
        assert!(resp.success, "{}", resp.message);

        let resp = session
            .handle(r#"{"type":"getFile","payload":{"fileName":"main.py","filePath":""}}"#)
            .await;
        assert_eq!(resp.payload.unwrap()["content"], "print('bye')\r\n");

        let resp = session
            .handle(r#"{"type":"getFile","payload":{"fileName":"passwd","filePath":"../../etc"}}"#)
            .await;
        assert!(resp.message.starts_with("Validation error:"));
    }

    #[tokio::test]
    async fn test_stop_then_close_is_idempotent() {
        let fx = fixture(true);
        let session = Session::new(Arc::clone(&fx.state));
        assert!(session.handle(&init_python()).await.success);
        assert_eq!(fx.cluster.object_count(), 1);

        let resp = session.handle(r#"{"type":"stopWorkspace"}"#).await;
        assert!(resp.success);
        assert_eq!(resp.payload.as_ref().unwrap()["cleanup"]["performed"], true);
        assert_eq!(fx.cluster.object_count(), 0);
        assert!(fx.state.registry.is_empty());

        let resp = session.handle(r#"{"type":"stopWorkspace"}"#).await;
        assert_eq!(resp.payload.unwrap()["cleanup"]["performed"], false);

        let report = session.close().await.unwrap();
        assert!(!report.performed);
    }

    #[tokio::test]
    async fn test_close_aborts_provisioning() {
        let fx = fixture(false);
        let mut config = fx.state.config.clone();
        config.readiness_timeout = std::time::Duration::from_secs(600);
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&fx.cluster)));
        let state = Arc::new(ControlPlaneState::new(config, connector));
        let session = Arc::new(Session::new(Arc::clone(&state)));

        let init = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.handle(&init_python()).await })
        };
        while fx.cluster.watches_opened() == 0 {
            tokio::task::yield_now().await;
        }

        let report = session.close().await.unwrap();
        let resp = init.await.unwrap();
        assert_eq!(resp.message, "Provisioning cancelled");
        assert!(report.performed);
        assert_eq!(fx.cluster.object_count(), 0);
        assert!(state.registry.is_empty());
    }
}
