//! In-process frame transport
//!
//! Connects a [`TerminalBridge`](super::TerminalBridge) to a client living
//! in the same process, without a socket in between.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::bridge::{ClientFrame, FrameSink, FrameSource, ServerFrame};

const INPUT_BUFFER: usize = 64;

/// Client end of an in-process terminal connection
pub struct ChannelClient {
    input: mpsc::Sender<ClientFrame>,
    output: mpsc::UnboundedReceiver<ServerFrame>,
}

impl ChannelClient {
    /// Send a text frame; silently dropped once the bridge is gone
    pub async fn send_text(&self, text: &str) {
        let _ = self.input.send(ClientFrame::Text(text.to_string())).await;
    }

    /// Send a binary frame
    pub async fn send_binary(&self, data: &[u8]) {
        let _ = self
            .input
            .send(ClientFrame::Binary(Bytes::copy_from_slice(data)))
            .await;
    }

    /// Next frame from the bridge, or `None` once it closed the connection
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.output.recv().await
    }

    /// Whether the bridge closed the connection (drains pending frames)
    pub async fn is_closed(&mut self) -> bool {
        while self.output.recv().await.is_some() {}
        true
    }
}

struct ChannelSource(mpsc::Receiver<ClientFrame>);

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<ClientFrame> {
        self.0.recv().await
    }
}

struct ChannelSink(Option<mpsc::UnboundedSender<ServerFrame>>);

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: ServerFrame) -> Result<(), String> {
        match &self.0 {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| "client dropped the connection".to_string()),
            None => Err("connection closed".to_string()),
        }
    }

    async fn close(&mut self) {
        self.0 = None;
    }
}

/// Create a connected client and the two halves a bridge consumes
pub fn channel_pair() -> (ChannelClient, Box<dyn FrameSource>, Box<dyn FrameSink>) {
    let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    (
        ChannelClient {
            input: input_tx,
            output: output_rx,
        },
        Box::new(ChannelSource(input_rx)),
        Box::new(ChannelSink(Some(output_tx))),
    )
}
