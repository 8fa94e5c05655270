//! Terminal sub-protocol
//!
//! The terminal connection carries two kinds of client messages:
//!
//! - `{"op":"stdin","data":"..."}`: keystrokes for the remote shell
//! - `{"op":"resize","rows":24,"cols":80}`: a new terminal size
//!
//! Text frames that are not one of these shapes are raw keystrokes and are
//! forwarded to the shell unmodified. A bare `{"rows":..,"cols":..}` object
//! (what xterm's resize event serializes to) is accepted as a resize.
//!
//! Server-to-client frames are raw shell output and carry no envelope.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Default terminal size (24x80)
    pub fn default_size() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// Structured terminal message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum TerminalMessage {
    /// Shell input
    Stdin { data: String },
    /// Terminal resize
    Resize { rows: u16, cols: u16 },
}

impl TerminalMessage {
    /// Encode as a JSON text frame
    pub fn encode(&self) -> String {
        // Both variants only hold strings and integers
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Decoded inbound terminal frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    /// Bytes for the shell's stdin
    Stdin(Bytes),
    /// New terminal size
    Resize(TerminalSize),
    /// Well-formed but meaningless (unknown op, zero-sized resize)
    Ignored,
}

/// Loose shape used to classify JSON text frames
#[derive(Debug, Deserialize)]
struct RawTerminalMessage {
    op: Option<String>,
    data: Option<String>,
    rows: Option<u16>,
    cols: Option<u16>,
}

impl TerminalInput {
    /// Classify a text frame from the terminal connection
    pub fn from_text(text: &str) -> Self {
        let raw: RawTerminalMessage = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(_) => return Self::Stdin(Bytes::copy_from_slice(text.as_bytes())),
        };

        match raw.op.as_deref() {
            Some("stdin") => match raw.data {
                Some(data) => Self::Stdin(Bytes::from(data)),
                None => Self::Ignored,
            },
            Some("resize") => Self::resize(raw.rows, raw.cols),
            Some(op) => {
                tracing::debug!("Ignoring terminal message with unknown op: {}", op);
                Self::Ignored
            }
            None if raw.rows.is_some() && raw.cols.is_some() => Self::resize(raw.rows, raw.cols),
            // JSON that is not a terminal message is something the user typed
            None => Self::Stdin(Bytes::copy_from_slice(text.as_bytes())),
        }
    }

    fn resize(rows: Option<u16>, cols: Option<u16>) -> Self {
        match (rows, cols) {
            (Some(rows), Some(cols)) if rows > 0 && cols > 0 => {
                Self::Resize(TerminalSize::new(rows, cols))
            }
            _ => Self::Ignored,
        }
    }

    /// Classify a binary frame (always raw stdin)
    pub fn from_binary(data: Bytes) -> Self {
        Self::Stdin(data)
    }
}
