//! Terminal connections

mod bridge;
mod channel;

pub use bridge::{ClientFrame, FrameSink, FrameSource, ServerFrame, TerminalBridge};
pub use channel::{channel_pair, ChannelClient};

/// URL path a client opens to attach to a workspace's shell
pub fn terminal_path(pod: &str, workspace_id: &str) -> String {
    format!("/ws?type=terminal&pod={}&workspaceId={}", pod, workspace_id)
}
