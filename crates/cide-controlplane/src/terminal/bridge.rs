//! Terminal bridge
//!
//! Adapts one framed client connection to the three exec capabilities.
//! Inbound frames are decoded on demand by whoever pulls stdin; resizes
//! overwrite a single-slot cell that the size consumer pulls from. Output
//! from stdout and stderr is serialized through one writer lock so every
//! chunk leaves as exactly one frame.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use cide_core::error::{ClusterError, ExecIoError};
use cide_core::traits::{
    ClusterApi, ExecIo, ExecTarget, OutputSink, OutputStream, StdinSource, TerminalSizeSource,
};
use cide_protocol::{TerminalInput, TerminalSize};

/// Frame received from the terminal client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
}

/// Frame sent to the terminal client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Text(String),
    Binary(Bytes),
}

impl ServerFrame {
    /// Text if the chunk is valid UTF-8, binary otherwise
    pub fn from_output(data: Bytes) -> Self {
        match std::str::from_utf8(&data) {
            Ok(text) => ServerFrame::Text(text.to_string()),
            Err(_) => ServerFrame::Binary(data),
        }
    }
}

/// Inbound half of a client connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the client has gone away
    async fn next_frame(&mut self) -> Option<ClientFrame>;
}

/// Outbound half of a client connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame
    async fn send_frame(&mut self, frame: ServerFrame) -> Result<(), String>;

    /// Close the connection
    async fn close(&mut self);
}

/// Bridges a client connection to a remote shell
pub struct TerminalBridge {
    reader: Mutex<Box<dyn FrameSource>>,
    writer: Mutex<Option<Box<dyn FrameSink>>>,
    pending_size: watch::Sender<Option<TerminalSize>>,
    size_rx: Mutex<watch::Receiver<Option<TerminalSize>>>,
    cancel: CancellationToken,
}

impl TerminalBridge {
    /// Create a bridge; cancelling `cancel` tears it down
    pub fn new(
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (pending_size, size_rx) = watch::channel(None);
        Arc::new(Self {
            reader: Mutex::new(source),
            writer: Mutex::new(Some(sink)),
            pending_size,
            size_rx: Mutex::new(size_rx),
            cancel,
        })
    }

    /// Token that ends this bridge
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the bridge has been torn down
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a resize, replacing any size not yet consumed
    pub fn resize(&self, size: TerminalSize) {
        self.pending_size.send_replace(Some(size));
    }

    /// Run `target` until the shell exits, the client leaves, or the bridge is cancelled
    ///
    /// Client disconnect is a normal end and returns `Ok`.
    pub async fn run(
        self: Arc<Self>,
        cluster: Arc<dyn ClusterApi>,
        target: ExecTarget,
    ) -> Result<(), ClusterError> {
        tracing::info!("Attaching terminal to {}/{}", target.namespace, target.pod);
        let io: Arc<dyn ExecIo> = self.clone();

        let result = tokio::select! {
            result = cluster.exec(&target, io) => result,
            _ = self.cancel.cancelled() => {
                tracing::debug!("Terminal for {} cancelled", target.pod);
                Ok(())
            }
        };

        self.shutdown().await;
        tracing::info!("Terminal for {} closed", target.pod);
        result
    }

    /// Release every blocked path and close the client connection
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            sink.close().await;
        }
    }
}

#[async_trait]
impl StdinSource for TerminalBridge {
    async fn read_stdin(&self) -> Option<Bytes> {
        let mut reader = self.reader.lock().await;
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                frame = reader.next_frame() => frame,
            };

            let input = match frame {
                Some(ClientFrame::Text(text)) => TerminalInput::from_text(&text),
                Some(ClientFrame::Binary(data)) => TerminalInput::from_binary(data),
                None => {
                    tracing::debug!("Terminal client disconnected");
                    self.cancel.cancel();
                    return None;
                }
            };

            match input {
                TerminalInput::Stdin(data) => return Some(data),
                TerminalInput::Resize(size) => self.resize(size),
                TerminalInput::Ignored => {}
            }
        }
    }
}

#[async_trait]
impl TerminalSizeSource for TerminalBridge {
    async fn next_size(&self) -> Option<TerminalSize> {
        let mut sizes = self.size_rx.lock().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = sizes.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    let latest = *sizes.borrow_and_update();
                    if let Some(size) = latest {
                        return Some(size);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl OutputSink for TerminalBridge {
    async fn write_output(&self, stream: OutputStream, data: Bytes) -> Result<(), ExecIoError> {
        let mut writer = self.writer.lock().await;
        if self.cancel.is_cancelled() {
            return Err(ExecIoError::Closed);
        }
        let Some(sink) = writer.as_mut() else {
            return Err(ExecIoError::Closed);
        };

        tracing::trace!("{:?}: {} bytes", stream, data.len());
        let sent = sink.send_frame(ServerFrame::from_output(data)).await;
        if let Err(e) = sent {
            tracing::debug!("Terminal client write failed: {}", e);
            *writer = None;
            self.cancel.cancel();
            return Err(ExecIoError::Send(e));
        }
        Ok(())
    }
}
