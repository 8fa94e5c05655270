//! Cluster API traits and the object shapes that cross them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::exec::ExecIo;
use crate::error::ClusterError;

/// Group/version/kind of a resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group (empty for the core group)
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
}

impl GroupVersionKind {
    /// Create a GVK
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Split an `apiVersion` (`v1`, `networking.k8s.io/v1`) and pair it with a kind
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// The `apiVersion` string for this GVK
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.api_version(), self.kind)
    }
}

/// A concrete resource type as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiResource {
    /// Group/version/kind served by this resource
    pub gvk: GroupVersionKind,
    /// Plural resource name (`pods`, `ingresses`)
    pub plural: String,
    /// Whether objects live in a namespace
    pub namespaced: bool,
}

impl ApiResource {
    /// Create a namespaced resource type
    pub fn namespaced(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            gvk: GroupVersionKind::new(group, version, kind),
            plural: plural.to_string(),
            namespaced: true,
        }
    }
}

/// A dynamically typed cluster object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceObject(pub Value);

impl ResourceObject {
    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.0.get("metadata")?.get(field)?.as_str()
    }

    /// `apiVersion`
    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion")?.as_str()
    }

    /// `kind`
    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind")?.as_str()
    }

    /// `metadata.name`
    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name")
    }

    /// `metadata.namespace`
    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace")
    }

    /// `metadata.resourceVersion`
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata_str("resourceVersion")
    }

    /// `metadata.labels`
    pub fn labels(&self) -> Option<&serde_json::Map<String, Value>> {
        self.0.get("metadata")?.get("labels")?.as_object()
    }

    fn metadata_mut(&mut self) -> Option<&mut serde_json::Map<String, Value>> {
        self.0
            .as_object_mut()?
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()))
            .as_object_mut()
    }

    /// Set `metadata.resourceVersion` (no-op on non-object documents)
    pub fn set_resource_version(&mut self, version: &str) {
        if let Some(metadata) = self.metadata_mut() {
            metadata.insert("resourceVersion".to_string(), Value::String(version.to_string()));
        }
    }

    /// Set `metadata.namespace` (no-op on non-object documents)
    pub fn set_namespace(&mut self, namespace: &str) {
        if let Some(metadata) = self.metadata_mut() {
            metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
        }
    }
}

/// A pod condition (`Ready`, `PodScheduled`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub kind: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
}

/// The parts of a pod the control plane cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSnapshot {
    /// Pod name
    pub name: String,
    /// `status.phase`
    pub phase: String,
    /// `status.conditions`
    pub conditions: Vec<PodCondition>,
}

impl PodSnapshot {
    /// Extract a snapshot from a pod object
    pub fn from_object(object: &ResourceObject) -> Option<Self> {
        let name = object.name()?.to_string();
        let status = object.0.get("status");
        let phase = status
            .and_then(|s| s.get("phase"))
            .and_then(Value::as_str)
            .unwrap_or("Pending")
            .to_string();
        let conditions = status
            .and_then(|s| s.get("conditions"))
            .and_then(|c| serde_json::from_value(c.clone()).ok())
            .unwrap_or_default();
        Some(Self {
            name,
            phase,
            conditions,
        })
    }

    /// Running and reporting a `Ready=True` condition
    pub fn is_ready(&self) -> bool {
        self.phase == "Running"
            && self
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
    }
}

/// Pod watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Pod added or modified
    Applied(PodSnapshot),
    /// Pod removed
    Deleted(PodSnapshot),
}

/// An open pod watch
///
/// Dropping the handle cancels the underlying watch, so the watch is
/// released on every exit path of whoever holds it.
#[derive(Debug)]
pub struct PodWatch {
    events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
}

impl PodWatch {
    /// Wrap an event channel; the backend stops producing when `cancel` fires
    pub fn new(events: mpsc::Receiver<WatchEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event, or `None` once the watch has ended
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Stop the watch
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PodWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Where to run an interactive command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub tty: bool,
}

/// Operations the control plane needs from the orchestration platform
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every served resource type
    async fn discover(&self) -> Result<Vec<ApiResource>, ClusterError>;

    /// Create an object; fails with `AlreadyExists` if the name is taken
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &ResourceObject,
    ) -> Result<ResourceObject, ClusterError>;

    /// Fetch an object
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<ResourceObject, ClusterError>;

    /// Replace an object; `object` must carry the current `resourceVersion`
    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &ResourceObject,
    ) -> Result<ResourceObject, ClusterError>;

    /// Delete an object
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError>;

    /// Point-in-time list of pods matching a label selector
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodSnapshot>, ClusterError>;

    /// Watch pods matching a label selector
    async fn watch_pods(&self, namespace: &str, selector: &str) -> Result<PodWatch, ClusterError>;

    /// Run a command in a container, driving `io` until the stream ends
    async fn exec(&self, target: &ExecTarget, io: Arc<dyn ExecIo>) -> Result<(), ClusterError>;
}

/// Builds cluster clients
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect and return a client handle
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>, ClusterError>;
}

/// Whether a pod's labels satisfy an equality selector (`a=b,c=d`)
pub fn selector_matches(selector: &str, labels: Option<&serde_json::Map<String, Value>>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|l| l.get(key.trim()))
                .and_then(Value::as_str)
                .map(|v| v == value.trim())
                .unwrap_or(false),
            None => false,
        })
}
