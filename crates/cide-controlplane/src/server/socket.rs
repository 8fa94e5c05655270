//! WebSocket connection loops

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use cide_core::traits::ExecTarget;

use crate::session::{Session, WorkspaceHandle};
use crate::state::ControlPlaneState;
use crate::terminal::{ClientFrame, FrameSink, FrameSource, ServerFrame, TerminalBridge};

/// Requests read ahead of the one being handled
const REQUEST_BUFFER: usize = 16;

/// Inbound half of a WebSocket as a terminal frame source
pub struct WsFrameSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn next_frame(&mut self) -> Option<ClientFrame> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(ClientFrame::Text(text)),
                Ok(Message::Binary(data)) => return Some(ClientFrame::Binary(Bytes::from(data))),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("Terminal socket read failed: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Outbound half of a WebSocket as a terminal frame sink
pub struct WsFrameSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: ServerFrame) -> Result<(), String> {
        let message = match frame {
            ServerFrame::Text(text) => Message::Text(text),
            ServerFrame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.0.send(message).await.map_err(|e| e.to_string())
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

/// Serve workspace requests until the client disconnects
///
/// Frames are read on a separate task so a disconnect is noticed even
/// while a long request such as `initProject` is being handled.
pub async fn run_session(socket: WebSocket, state: Arc<ControlPlaneState>) {
    let (mut sender, mut receiver) = socket.split();
    let session = Arc::new(Session::new(state));
    let closed = session.closed_token().clone();
    let (tx, mut rx) = mpsc::channel::<String>(REQUEST_BUFFER);

    tracing::info!("Client connected");

    let reader = {
        let closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        tracing::debug!("Ignoring binary frame on workspace connection")
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("Workspace socket read failed: {}", e);
                        break;
                    }
                }
            }
            closed.cancel();
        })
    };

    loop {
        tokio::select! {
            text = rx.recv() => {
                let Some(text) = text else { break };
                let response = session.handle(&text).await;
                let encoded = match response.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        tracing::error!("Failed to encode response: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(encoded)).await.is_err() {
                    break;
                }
            }
            _ = closed.cancelled() => break,
        }
    }

    reader.abort();
    if let Some(report) = session.close().await {
        tracing::debug!("Disconnect cleanup: {:?}", report);
    }
    let _ = sender.close().await;
    tracing::info!("Client disconnected");
}

/// Attach a terminal to a workspace's shell pod
pub async fn run_terminal(
    socket: WebSocket,
    state: Arc<ControlPlaneState>,
    workspace: Arc<WorkspaceHandle>,
) {
    let (mut sender, receiver) = socket.split();

    let cluster = match state.connector.connect().await {
        Ok(cluster) => cluster,
        Err(e) => {
            tracing::error!("Error creating K8s client: {}", e);
            let _ = sender
                .send(Message::Text(format!("Error creating K8s client: {}\r\n", e)))
                .await;
            let _ = sender.close().await;
            return;
        }
    };

    let bridge = TerminalBridge::new(
        Box::new(WsFrameSource(receiver)),
        Box::new(WsFrameSink(sender)),
        workspace.cancel_token().child_token(),
    );
    let target = ExecTarget {
        namespace: state.config.namespace.clone(),
        pod: workspace.names.pod.clone(),
        container: state.config.shell_container.clone(),
        command: state.config.shell_command.clone(),
        tty: true,
    };

    if let Err(e) = bridge.run(cluster, target).await {
        tracing::error!("Terminal for workspace {} failed: {}", workspace.id, e);
    }
}
