//! Kubernetes backend

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ::kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, ListParams, PostParams, WatchEvent as KubeEvent,
    WatchParams,
};
use ::kube::core::{ApiResource as KubeResource, GroupVersionKind as KubeGvk};
use ::kube::discovery::{Discovery, Scope};
use ::kube::Client;

use cide_core::error::ClusterError;
use cide_core::traits::{
    ApiResource, ClusterApi, ClusterConnector, ExecIo, ExecTarget, GroupVersionKind,
    OutputStream, PodSnapshot, PodWatch, ResourceObject, WatchEvent,
};

const WATCH_BUFFER: usize = 64;
const OUTPUT_CHUNK: usize = 8192;

fn map_error(kind: &str, name: &str, err: ::kube::Error) -> ClusterError {
    match err {
        ::kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        ::kube::Error::Api(resp) if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        ::kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: resp.message,
        },
        ::kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => {
            ClusterError::Invalid(resp.message)
        }
        other => ClusterError::Api(other.to_string()),
    }
}

fn to_dynamic(object: &ResourceObject) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(object.0.clone()).map_err(|e| ClusterError::Invalid(e.to_string()))
}

fn from_dynamic(object: &DynamicObject) -> Result<ResourceObject, ClusterError> {
    serde_json::to_value(object)
        .map(ResourceObject)
        .map_err(|e| ClusterError::Api(e.to_string()))
}

fn snapshot(pod: &Pod) -> Option<PodSnapshot> {
    let value = serde_json::to_value(pod).ok()?;
    PodSnapshot::from_object(&ResourceObject(value))
}

/// Cluster backend talking to a real Kubernetes API server
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        let gvk = KubeGvk::gvk(&resource.gvk.group, &resource.gvk.version, &resource.gvk.kind);
        let ar = KubeResource::from_gvk_with_plural(&gvk, &resource.plural);
        if resource.namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }
}

async fn pump<R>(reader: Option<R>, stream: OutputStream, io: &dyn ExecIo)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if io
                    .write_output(stream, Bytes::copy_from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Exec {:?} stream ended with error: {}", stream, e);
                break;
            }
        }
    }
}

/// Forward stdout and stderr until both have ended
async fn drain_output<O, E>(stdout: Option<O>, stderr: Option<E>, io: &dyn ExecIo)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    if stdout.is_none() && stderr.is_none() {
        return std::future::pending().await;
    }
    futures::join!(
        pump(stdout, OutputStream::Stdout, io),
        pump(stderr, OutputStream::Stderr, io),
    );
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn discover(&self) -> Result<Vec<ApiResource>, ClusterError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;

        let mut resources = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                resources.push(ApiResource {
                    gvk: GroupVersionKind::new(&ar.group, &ar.version, &ar.kind),
                    plural: ar.plural.clone(),
                    namespaced: caps.scope == Scope::Namespaced,
                });
            }
        }
        Ok(resources)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &ResourceObject,
    ) -> Result<ResourceObject, ClusterError> {
        let name = object.name().unwrap_or_default().to_string();
        let created = self
            .dynamic(resource, namespace)
            .create(&PostParams::default(), &to_dynamic(object)?)
            .await
            .map_err(|e| map_error(&resource.gvk.kind, &name, e))?;
        from_dynamic(&created)
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<ResourceObject, ClusterError> {
        let object = self
            .dynamic(resource, namespace)
            .get(name)
            .await
            .map_err(|e| map_error(&resource.gvk.kind, name, e))?;
        from_dynamic(&object)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &ResourceObject,
    ) -> Result<ResourceObject, ClusterError> {
        let name = object.name().unwrap_or_default().to_string();
        let replaced = self
            .dynamic(resource, namespace)
            .replace(&name, &PostParams::default(), &to_dynamic(object)?)
            .await
            .map_err(|e| map_error(&resource.gvk.kind, &name, e))?;
        from_dynamic(&replaced)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.dynamic(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_error(&resource.gvk.kind, name, e))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodSnapshot>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| map_error("Pod", selector, e))?;
        Ok(list.items.iter().filter_map(snapshot).collect())
    }

    async fn watch_pods(&self, namespace: &str, selector: &str) -> Result<PodWatch, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut stream = pods
            .watch(&WatchParams::default().labels(selector), "0")
            .await
            .map_err(|e| map_error("Pod", selector, e))?
            .boxed();

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let selector = selector.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = stream.next() => event,
                };
                let event = match event {
                    Some(Ok(KubeEvent::Added(pod))) | Some(Ok(KubeEvent::Modified(pod))) => {
                        snapshot(&pod).map(WatchEvent::Applied)
                    }
                    Some(Ok(KubeEvent::Deleted(pod))) => snapshot(&pod).map(WatchEvent::Deleted),
                    Some(Ok(KubeEvent::Bookmark(_))) => None,
                    Some(Ok(KubeEvent::Error(e))) => {
                        tracing::warn!("Pod watch for {} failed: {}", selector, e.message);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Pod watch for {} failed: {}", selector, e);
                        break;
                    }
                    None => break,
                };
                if let Some(event) = event {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            tracing::debug!("Pod watch for {} released", selector);
        });

        Ok(PodWatch::new(rx, cancel))
    }

    async fn exec(&self, target: &ExecTarget, io: Arc<dyn ExecIo>) -> Result<(), ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = if target.tty {
            AttachParams::interactive_tty()
        } else {
            AttachParams::default().stdin(true).stdout(true).stderr(true)
        }
        .container(target.container.clone());

        let mut attached = pods
            .exec(&target.pod, target.command.clone(), &params)
            .await
            .map_err(|e| map_error("Pod", &target.pod, e))?;

        let stdin = attached.stdin();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let sizes = attached.terminal_size();
        let io = io.as_ref();

        let stdin_loop = async {
            let Some(mut stdin) = stdin else {
                return std::future::pending().await;
            };
            while let Some(data) = io.read_stdin().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
            }
        };
        let size_loop = async {
            if let Some(mut tx) = sizes {
                while let Some(size) = io.next_size().await {
                    let size = ::kube::api::TerminalSize {
                        width: size.cols,
                        height: size.rows,
                    };
                    if tx.send(size).await.is_err() {
                        break;
                    }
                }
            }
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = stdin_loop => tracing::debug!("Terminal input ended for {}", target.pod),
            _ = drain_output(stdout, stderr, io) => tracing::debug!("Shell exited in {}", target.pod),
            _ = size_loop => {}
        }

        attached.abort();
        Ok(())
    }
}

/// Builds clients from the ambient kubeconfig or in-cluster service account
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Connect(e.to_string()))?;
        Ok(Arc::new(KubeCluster::new(client)))
    }
}
