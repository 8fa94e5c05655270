//! In-process sandbox cluster
//!
//! Keeps objects in memory with real optimistic-concurrency semantics
//! (monotonic `resourceVersion`, conflicts on stale updates), simulates pod
//! readiness, serves label-selector lists and watches, and answers exec
//! requests with an echo shell. Used for local development
//! (`--backend memory`) and throughout the test suite.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cide_core::error::ClusterError;
use cide_core::traits::{
    selector_matches, ApiResource, ClusterApi, ClusterConnector, ExecIo, ExecTarget, OutputStream,
    PodSnapshot, PodWatch, ResourceObject, WatchEvent,
};
use cide_protocol::TerminalSize;

const WATCH_BUFFER: usize = 64;

/// Object key: (plural, namespace, name)
type ObjectKey = (String, String, String);

struct Watcher {
    namespace: String,
    selector: String,
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct MemoryState {
    resources: Vec<ApiResource>,
    objects: BTreeMap<ObjectKey, ResourceObject>,
    next_version: u64,
    watchers: Vec<Watcher>,
    pending_conflicts: usize,
    failing_deletes: HashSet<String>,
    terminal_sizes: Vec<TerminalSize>,
}

impl MemoryState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn notify(&mut self, namespace: &str, object: &ResourceObject, deleted: bool) {
        let Some(pod) = PodSnapshot::from_object(object) else {
            return;
        };
        self.watchers.retain(|w| !w.cancel.is_cancelled() && !w.tx.is_closed());
        for watcher in &self.watchers {
            if watcher.namespace == namespace && selector_matches(&watcher.selector, object.labels())
            {
                let event = if deleted {
                    WatchEvent::Deleted(pod.clone())
                } else {
                    WatchEvent::Applied(pod.clone())
                };
                if watcher.tx.try_send(event).is_err() {
                    tracing::warn!("Dropping watch event for pod {}: watcher is full", pod.name);
                }
            }
        }
    }
}

fn default_resources() -> Vec<ApiResource> {
    vec![
        ApiResource::namespaced("", "v1", "Pod", "pods"),
        ApiResource::namespaced("", "v1", "Service", "services"),
        ApiResource::namespaced("", "v1", "ConfigMap", "configmaps"),
        ApiResource::namespaced("", "v1", "Secret", "secrets"),
        ApiResource::namespaced("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims"),
        ApiResource::namespaced("apps", "v1", "Deployment", "deployments"),
        ApiResource::namespaced("apps", "v1", "StatefulSet", "statefulsets"),
        ApiResource::namespaced("batch", "v1", "Job", "jobs"),
        ApiResource::namespaced("networking.k8s.io", "v1", "Ingress", "ingresses"),
    ]
}

fn ready_status() -> Value {
    json!({
        "phase": "Running",
        "conditions": [
            {"type": "PodScheduled", "status": "True"},
            {"type": "Ready", "status": "True"}
        ]
    })
}

/// In-memory cluster backend
pub struct MemoryCluster {
    state: Mutex<MemoryState>,
    auto_ready: bool,
    discover_calls: AtomicUsize,
    watches_opened: AtomicUsize,
    exec_calls: AtomicUsize,
}

impl MemoryCluster {
    /// Create an empty cluster serving the built-in resource types
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                resources: default_resources(),
                ..Default::default()
            }),
            auto_ready: false,
            discover_calls: AtomicUsize::new(0),
            watches_opened: AtomicUsize::new(0),
            exec_calls: AtomicUsize::new(0),
        }
    }

    /// Mark pods Running and Ready as soon as they are created
    pub fn with_auto_ready(mut self, auto_ready: bool) -> Self {
        self.auto_ready = auto_ready;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup_kind(&self, resource: &ApiResource) -> Result<(), ClusterError> {
        if self.lock().resources.iter().any(|r| r == resource) {
            Ok(())
        } else {
            Err(ClusterError::Invalid(format!(
                "resource type {} is not served",
                resource.gvk
            )))
        }
    }

    fn key(resource: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
        let namespace = if resource.namespaced { namespace } else { "" };
        (resource.plural.clone(), namespace.to_string(), name.to_string())
    }

    fn object_name(resource: &ApiResource, object: &ResourceObject) -> Result<String, ClusterError> {
        object.name().map(str::to_string).ok_or_else(|| {
            ClusterError::Invalid(format!("{} without metadata.name", resource.gvk.kind))
        })
    }

    /// Serve an additional resource type from discovery
    pub fn register_resource(&self, resource: ApiResource) {
        let mut state = self.lock();
        if !state.resources.contains(&resource) {
            state.resources.push(resource);
        }
    }

    /// Set a pod's phase and Ready condition, notifying watchers
    pub fn set_pod_status(&self, namespace: &str, name: &str, phase: &str, ready: bool) -> bool {
        let mut state = self.lock();
        let key = ("pods".to_string(), namespace.to_string(), name.to_string());
        let Some(mut object) = state.objects.get(&key).cloned() else {
            return false;
        };
        let ready = if ready { "True" } else { "False" };
        if let Some(root) = object.0.as_object_mut() {
            root.insert(
                "status".to_string(),
                json!({"phase": phase, "conditions": [{"type": "Ready", "status": ready}]}),
            );
        }
        let version = state.bump_version();
        object.set_resource_version(&version);
        state.objects.insert(key, object.clone());
        state.notify(namespace, &object, false);
        true
    }

    /// Make the next `count` updates fail with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.lock().pending_conflicts = count;
    }

    /// Make every delete of `kind` fail with an API error
    pub fn fail_deletes(&self, kind: &str) {
        self.lock().failing_deletes.insert(kind.to_string());
    }

    /// End every open watch as if the server closed it
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Fetch a stored object without going through the API
    pub fn object(&self, plural: &str, namespace: &str, name: &str) -> Option<ResourceObject> {
        self.lock()
            .objects
            .get(&(plural.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Number of discovery calls served
    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    /// Number of watches ever opened
    pub fn watches_opened(&self) -> usize {
        self.watches_opened.load(Ordering::SeqCst)
    }

    /// Number of watches still held open by a caller
    pub fn active_watches(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.cancel.is_cancelled());
        state.watchers.len()
    }

    /// Number of exec sessions started
    pub fn exec_calls(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    /// Terminal sizes observed by exec sessions, in order
    pub fn terminal_sizes(&self) -> Vec<TerminalSize> {
        self.lock().terminal_sizes.clone()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn discover(&self) -> Result<Vec<ApiResource>, ClusterError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().resources.clone())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &ResourceObject,
    ) -> Result<ResourceObject, ClusterError> {
        self.lookup_kind(resource)?;
        let name = Self::object_name(resource, object)?;
        let key = Self::key(resource, namespace, &name);

        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: resource.gvk.kind.clone(),
                name,
            });
        }

        let mut stored = object.clone();
        if resource.namespaced {
            stored.set_namespace(namespace);
        }
        let version = state.bump_version();
        stored.set_resource_version(&version);
        if resource.plural == "pods" {
            let status = if self.auto_ready {
                ready_status()
            } else {
                json!({"phase": "Pending"})
            };
            if let Some(root) = stored.0.as_object_mut() {
                root.insert("status".to_string(), status);
            }
        }

        state.objects.insert(key, stored.clone());
        if resource.plural == "pods" {
            state.notify(namespace, &stored, false);
        }
        tracing::debug!("Created {} {} (rv {})", resource.gvk.kind, name, version);
        Ok(stored)
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<ResourceObject, ClusterError> {
        self.lookup_kind(resource)?;
        self.lock()
            .objects
            .get(&Self::key(resource, namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: resource.gvk.kind.clone(),
                name: name.to_string(),
            })
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &ResourceObject,
    ) -> Result<ResourceObject, ClusterError> {
        self.lookup_kind(resource)?;
        let name = Self::object_name(resource, object)?;
        let key = Self::key(resource, namespace, &name);
        let kind = resource.gvk.kind.clone();

        let mut state = self.lock();
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(ClusterError::NotFound { kind, name });
        };

        let Some(requested) = object.resource_version() else {
            return Err(ClusterError::Invalid(
                "metadata.resourceVersion must be specified for an update".to_string(),
            ));
        };

        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(ClusterError::Conflict {
                kind,
                name,
                message: "the object has been modified".to_string(),
            });
        }

        if current.resource_version() != Some(requested) {
            return Err(ClusterError::Conflict {
                kind,
                name,
                message: format!(
                    "resourceVersion {} is stale (current {})",
                    requested,
                    current.resource_version().unwrap_or("-")
                ),
            });
        }

        let mut stored = object.clone();
        if resource.namespaced {
            stored.set_namespace(namespace);
        }
        // Status is owned by the cluster
        if let (Some(status), Some(root)) = (current.0.get("status"), stored.0.as_object_mut()) {
            root.insert("status".to_string(), status.clone());
        }
        let version = state.bump_version();
        stored.set_resource_version(&version);
        state.objects.insert(key, stored.clone());
        if resource.plural == "pods" {
            state.notify(namespace, &stored, false);
        }
        tracing::debug!("Updated {} {} (rv {})", kind, name, version);
        Ok(stored)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.lookup_kind(resource)?;
        let mut state = self.lock();
        if state.failing_deletes.contains(&resource.gvk.kind) {
            return Err(ClusterError::Api(format!(
                "delete of {} {} rejected",
                resource.gvk.kind, name
            )));
        }
        match state.objects.remove(&Self::key(resource, namespace, name)) {
            Some(object) => {
                if resource.plural == "pods" {
                    state.notify(namespace, &object, true);
                }
                Ok(())
            }
            None => Err(ClusterError::NotFound {
                kind: resource.gvk.kind.clone(),
                name: name.to_string(),
            }),
        }
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodSnapshot>, ClusterError> {
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|((plural, ns, _), object)| {
                plural == "pods" && ns == namespace && selector_matches(selector, object.labels())
            })
            .filter_map(|(_, object)| PodSnapshot::from_object(object))
            .collect())
    }

    async fn watch_pods(&self, namespace: &str, selector: &str) -> Result<PodWatch, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let cancel = CancellationToken::new();

        let mut state = self.lock();
        // Like a watch started without a resourceVersion, replay current state first
        for ((plural, ns, _), object) in &state.objects {
            if plural == "pods" && ns == namespace && selector_matches(selector, object.labels()) {
                if let Some(pod) = PodSnapshot::from_object(object) {
                    let _ = tx.try_send(WatchEvent::Applied(pod));
                }
            }
        }
        state.watchers.push(Watcher {
            namespace: namespace.to_string(),
            selector: selector.to_string(),
            tx,
            cancel: cancel.clone(),
        });
        self.watches_opened.fetch_add(1, Ordering::SeqCst);
        Ok(PodWatch::new(rx, cancel))
    }

    async fn exec(&self, target: &ExecTarget, io: Arc<dyn ExecIo>) -> Result<(), ClusterError> {
        let key = ("pods".to_string(), target.namespace.clone(), target.pod.clone());
        if !self.lock().objects.contains_key(&key) {
            return Err(ClusterError::NotFound {
                kind: "Pod".to_string(),
                name: target.pod.clone(),
            });
        }
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "Exec {:?} in {}/{} (container {})",
            target.command,
            target.namespace,
            target.pod,
            target.container
        );

        let banner = format!("Connected to {}\r\n", target.pod);
        if io
            .write_output(OutputStream::Stdout, Bytes::from(banner))
            .await
            .is_err()
        {
            return Ok(());
        }

        let echo = async {
            while let Some(data) = io.read_stdin().await {
                if io.write_output(OutputStream::Stdout, data).await.is_err() {
                    break;
                }
            }
        };
        let sizes = async {
            while let Some(size) = io.next_size().await {
                self.lock().terminal_sizes.push(size);
            }
            // No more sizes: the session is being torn down
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = echo => {}
            _ = sizes => {}
        }
        Ok(())
    }
}

/// Connector handing out a shared in-memory cluster
pub struct MemoryConnector {
    cluster: Arc<MemoryCluster>,
}

impl MemoryConnector {
    pub fn new(cluster: Arc<MemoryCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ClusterConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>, ClusterError> {
        Ok(Arc::clone(&self.cluster) as Arc<dyn ClusterApi>)
    }
}
