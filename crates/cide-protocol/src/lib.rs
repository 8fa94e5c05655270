//! cide-protocol: Client wire protocol for the cloud IDE control plane
//!
//! This crate defines the JSON messages exchanged between the browser
//! client and the control plane: the request/response envelopes used on
//! the workspace connection, and the terminal sub-protocol spoken on the
//! dedicated terminal connection.

pub mod error;
pub mod message;
pub mod terminal;

pub use error::ProtocolError;
pub use message::{
    CreateFolderPayload, DeleteFolderPayload, FilePayload, InitProjectPayload, Request,
    RequestTerminalPayload, RequestType, Response, UpdateFilePayload, Validate,
};
pub use terminal::{TerminalInput, TerminalMessage, TerminalSize};
