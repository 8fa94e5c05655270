//! Exec stream capabilities
//!
//! A cluster backend drives an interactive exec through three independent
//! capabilities: a source of stdin bytes, a sink for process output, and a
//! pull-based source of terminal sizes. The terminal bridge implements all
//! three over one client connection.

use async_trait::async_trait;
use bytes::Bytes;
use cide_protocol::TerminalSize;

use crate::error::ExecIoError;

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Source of bytes for the remote process's stdin
#[async_trait]
pub trait StdinSource: Send + Sync {
    /// Next chunk of input, or `None` once input has ended for good
    async fn read_stdin(&self) -> Option<Bytes>;
}

/// Sink for the remote process's output
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Deliver one chunk; may be called concurrently for stdout and stderr
    async fn write_output(&self, stream: OutputStream, data: Bytes) -> Result<(), ExecIoError>;
}

/// Pull-based terminal size queries
#[async_trait]
pub trait TerminalSizeSource: Send + Sync {
    /// Wait for the next size, or `None` once no further sizes will arrive
    async fn next_size(&self) -> Option<TerminalSize>;
}

/// All three capabilities together
pub trait ExecIo: StdinSource + OutputSink + TerminalSizeSource {}

impl<T> ExecIo for T where T: StdinSource + OutputSink + TerminalSizeSource {}
