//! Session integration tests
//!
//! Drives full sessions against the in-memory cluster, using the bundled
//! manifests and project templates.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use cide_controlplane::cluster::{MemoryCluster, MemoryConnector};
use cide_controlplane::server::{authorize_terminal, Gateway, WsQuery};
use cide_controlplane::terminal::{channel_pair, ServerFrame, TerminalBridge};
use cide_controlplane::{ControlPlaneState, Session};
use cide_core::config::ControlPlaneConfig;
use cide_core::traits::{ClusterApi, ExecTarget};
use cide_core::{WorkspaceId, WorkspaceState};
use cide_protocol::Response;

fn repo_dir(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join(name)
}

struct TestEnv {
    cache: tempfile::TempDir,
    cluster: Arc<MemoryCluster>,
    state: Arc<ControlPlaneState>,
}

/// Create test state backed by an auto-ready in-memory cluster
fn create_test_env() -> TestEnv {
    let cache = tempfile::tempdir().unwrap();
    let mut config = ControlPlaneConfig::default();
    config.namespace = "ide-test".to_string();
    config.cache_dir = cache.path().to_path_buf();
    config.templates_dir = repo_dir("templates");
    config.manifests_dir = repo_dir("manifests");

    let cluster = Arc::new(MemoryCluster::new().with_auto_ready(true));
    let connector = Arc::new(MemoryConnector::new(Arc::clone(&cluster)));
    TestEnv {
        cache,
        cluster,
        state: Arc::new(ControlPlaneState::new(config, connector)),
    }
}

async fn init(session: &Session, project: &str) -> Response {
    session
        .handle(&format!(
            r#"{{"type":"initProject","payload":{{"projectType":"{}"}}}}"#,
            project
        ))
        .await
}

fn workspace_id(response: &Response) -> String {
    response.payload.as_ref().unwrap()["workspaceId"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_init_python_project() {
    let env = create_test_env();
    let session = Session::new(Arc::clone(&env.state));

    let resp = init(&session, "python").await;
    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.message, "Project created successfully");

    let id = workspace_id(&resp);
    assert_eq!(id.len(), 10);
    assert!(id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    assert!(env.cache.path().join(&id).join("main.py").is_file());

    let pod = env
        .cluster
        .object("pods", "ide-test", &format!("shell-{}", id))
        .unwrap();
    assert_eq!(
        pod.0["spec"]["containers"][0]["image"],
        "ghcr.io/mudit06mah/shell-python:latest"
    );
    assert_eq!(pod.0["metadata"]["labels"]["workspace"], Value::from(id.clone()));

    let tree = &resp.payload.as_ref().unwrap()["tree"];
    assert_eq!(tree["type"], "folder");
    assert_eq!(tree["children"][0]["name"], "main.py");

    let parsed = WorkspaceId::parse(&id).unwrap();
    assert_eq!(
        env.state.registry.get(&parsed).unwrap().state(),
        WorkspaceState::Ready
    );
}

#[tokio::test]
async fn test_init_react_renders_service_and_ingress() {
    let env = create_test_env();
    let session = Session::new(Arc::clone(&env.state));

    let resp = init(&session, "react").await;
    assert!(resp.success, "{}", resp.message);
    let id = workspace_id(&resp);

    assert!(env
        .cluster
        .object("services", "ide-test", &format!("svc-{}", id))
        .is_some());
    let ingress = env
        .cluster
        .object("ingresses", "ide-test", &format!("ingress-{}", id))
        .unwrap();
    assert_eq!(
        ingress.0["spec"]["rules"][0]["host"],
        Value::from(format!("{}.localhost", id))
    );
    assert_eq!(env.cluster.object_count(), 3);

    // folders sort before files
    let children = resp.payload.as_ref().unwrap()["tree"]["children"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(children[0]["name"], "src");
    assert_eq!(children[0]["type"], "folder");
}

#[tokio::test]
async fn test_request_terminal_before_init() {
    let env = create_test_env();
    let session = Session::new(Arc::clone(&env.state));

    let resp = session
        .handle(r#"{"type":"requestTerminal","payload":{"workspaceId":"abc"}}"#)
        .await;
    assert!(!resp.success);
    assert_eq!(resp.message, "K8s client not initialized");

    // the session keeps working afterwards
    assert!(init(&session, "golang").await.success);
}

#[tokio::test]
async fn test_file_operations() {
    let env = create_test_env();
    let session = Session::new(Arc::clone(&env.state));
    assert!(init(&session, "nodejs").await.success);

    let resp = session
        .handle(r#"{"type":"createFolder","payload":{"folderName":"lib","folderPath":""}}"#)
        .await;
    assert_eq!(resp.message, "Folder created successfully");

    let resp = session
        .handle(r#"{"type":"createFile","payload":{"fileName":"util.js","filePath":"lib"}}"#)
        .await;
    assert_eq!(resp.message, "File created successfully");

    let resp = session
        .handle(r#"{"type":"getFile","payload":{"fileName":"index.js","filePath":""}}"#)
        .await;
    assert_eq!(resp.message, "File retrieved successfully");
    assert!(resp.payload.unwrap()["content"]
        .as_str()
        .unwrap()
        .contains("Hello from your workspace"));

    // "Y29uc3QgeCA9IDE7" is base64 for "const x = 1;"
    let resp = session
        .handle(r#"{"type":"updateFile","payload":{"fileName":"index.js","filePath":"","lineNumber":1,"lineContent":"Y29uc3QgeCA9IDE7"}}"#)
        .await;
    assert_eq!(resp.message, "File updated successfully");

    let resp = session
        .handle(r#"{"type":"updateFile","payload":{"fileName":"index.js","filePath":"","lineNumber":99,"lineContent":"eA=="}}"#)
        .await;
    assert_eq!(resp.message, "Line number exceeds file length");

    let resp = session.handle(r#"{"type":"getTree"}"#).await;
    assert_eq!(resp.message, "Tree retrieved successfully");
    assert_eq!(resp.payload.unwrap()["children"][0]["name"], "lib");

    let resp = session
        .handle(r#"{"type":"deleteFile","payload":{"fileName":"util.js","filePath":"lib"}}"#)
        .await;
    assert_eq!(resp.message, "File deleted successfully");

    let resp = session
        .handle(r#"{"type":"deleteFolder","payload":{"filePath":"lib"}}"#)
        .await;
    assert_eq!(resp.message, "Folder deleted successfully");

    let resp = session
        .handle(r#"{"type":"getFile","payload":{"fileName":"util.js","filePath":"lib"}}"#)
        .await;
    assert!(resp.message.starts_with("File does not exist:"));

    let resp = session.handle(r#"{"type":"createFile","payload":{}}"#).await;
    assert!(resp.message.starts_with("Validation error:"));
}

#[tokio::test]
async fn test_terminal_attach_and_stop() {
    let env = create_test_env();
    let session = Session::new(Arc::clone(&env.state));
    let resp = init(&session, "python").await;
    let id = workspace_id(&resp);

    let resp = session
        .handle(&format!(
            r#"{{"type":"requestTerminal","payload":{{"workspaceId":"{}"}}}}"#,
            id
        ))
        .await;
    assert_eq!(resp.message, "Terminal ready");
    let payload = resp.payload.unwrap();
    let pod = payload["pod"].as_str().unwrap().to_string();
    assert_eq!(
        payload["path"],
        Value::from(format!("/ws?type=terminal&pod={}&workspaceId={}", pod, id))
    );

    let workspace = authorize_terminal(
        &env.state,
        &WsQuery {
            kind: Some("terminal".to_string()),
            pod: Some(pod.clone()),
            workspace_id: Some(id.clone()),
        },
    )
    .unwrap();

    let (mut client, source, sink) = channel_pair();
    let bridge = TerminalBridge::new(source, sink, workspace.cancel_token().child_token());
    let target = ExecTarget {
        namespace: "ide-test".to_string(),
        pod: pod.clone(),
        container: "shell".to_string(),
        command: vec!["/bin/bash".to_string()],
        tty: true,
    };
    let cluster: Arc<dyn ClusterApi> = env.cluster.clone();
    let run = tokio::spawn(bridge.clone().run(cluster, target));

    assert_eq!(
        client.recv().await,
        Some(ServerFrame::Text(format!("Connected to {}\r\n", pod)))
    );
    client.send_text(r#"{"op":"stdin","data":"ls\r"}"#).await;
    assert_eq!(client.recv().await, Some(ServerFrame::Text("ls\r".to_string())));

    let resp = session.handle(r#"{"type":"stopWorkspace"}"#).await;
    assert_eq!(resp.message, "Workspace stopped");

    timeout(Duration::from_secs(5), run)
        .await
        .expect("terminal did not stop with its workspace")
        .unwrap()
        .unwrap();
    assert!(bridge.is_closed());
    assert!(client.is_closed().await);
    assert_eq!(env.cluster.object_count(), 0);
}

#[tokio::test]
async fn test_disconnect_cleans_up() {
    let env = create_test_env();
    let session = Session::new(Arc::clone(&env.state));
    let resp = init(&session, "cpp").await;
    let id = workspace_id(&resp);
    assert!(env.cache.path().join(&id).exists());

    let report = session.close().await.unwrap();
    assert!(report.performed);
    assert!(report.is_clean());
    assert_eq!(report.deleted.len(), 1);

    assert!(env.state.registry.is_empty());
    assert!(!env.cache.path().join(&id).exists());
    assert_eq!(env.cluster.object_count(), 0);

    // a second cleanup is a no-op
    assert!(!session.close().await.unwrap().performed);
}

#[tokio::test]
async fn test_cleanup_continues_past_failed_delete() {
    let env = create_test_env();
    let session = Session::new(Arc::clone(&env.state));
    assert!(init(&session, "react").await.success);
    env.cluster.fail_deletes("Service");

    let resp = session.handle(r#"{"type":"stopWorkspace"}"#).await;
    assert!(resp.success);
    let cleanup = &resp.payload.as_ref().unwrap()["cleanup"];
    assert_eq!(cleanup["failures"].as_array().unwrap().len(), 1);
    assert_eq!(cleanup["deleted"].as_array().unwrap().len(), 2);
    assert!(env.state.registry.is_empty());

    // the session may start over after a stop
    assert!(init(&session, "python").await.success);
}

#[tokio::test]
async fn test_concurrent_sessions_get_unique_ids() {
    let env = create_test_env();
    let sessions: Vec<_> = (0..8)
        .map(|_| Session::new(Arc::clone(&env.state)))
        .collect();

    let responses = futures::future::join_all(sessions.iter().map(|s| init(s, "python"))).await;
    let ids: HashSet<_> = responses
        .iter()
        .map(|r| {
            assert!(r.success, "{}", r.message);
            workspace_id(r)
        })
        .collect();

    assert_eq!(ids.len(), 8);
    assert_eq!(env.state.registry.len(), 8);
    assert_eq!(env.cluster.object_count(), 8);
}

#[tokio::test]
async fn test_healthz_over_tcp() {
    let env = create_test_env();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let gateway = Gateway::new(address.to_string(), Arc::clone(&env.state))
        .with_shutdown_token(shutdown.clone());
    let server = tokio::spawn(async move { gateway.serve(listener).await });

    let mut stream = TcpStream::connect(address).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("health check timed out")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(r#""workspaces":0"#));

    shutdown.cancel();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("gateway did not shut down")
        .unwrap()
        .unwrap();
}
