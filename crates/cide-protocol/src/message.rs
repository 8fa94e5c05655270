//! Request and response envelopes for the workspace connection
//!
//! Every client frame is a JSON object `{ "type": ..., "payload": ... }`.
//! The `type` discriminator selects exactly one handler on the server; the
//! payload is decoded lazily by that handler into one of the typed payload
//! structs below, so an unknown `type` never fails envelope decoding.
//!
//! Every server reply is a [`Response`]: `{ "success", "message", "payload"? }`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Request envelope sent by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload, decoded by the handler
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    /// Create a request envelope
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Decode a request envelope from a raw text frame
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Envelope)
    }

    /// The recognized request type, if any
    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::parse(&self.kind)
    }

    /// Decode and validate the payload as `T`
    ///
    /// A missing or `null` payload is treated as an empty object so that
    /// payload-less requests (`getTree`, `stopWorkspace`) decode cleanly.
    pub fn payload_as<T>(&self) -> Result<T, ProtocolError>
    where
        T: DeserializeOwned + Validate,
    {
        let payload = match &self.payload {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        let data: T = serde_json::from_value(payload).map_err(|source| ProtocolError::Payload {
            kind: self.kind.clone(),
            source,
        })?;
        data.validate()?;
        Ok(data)
    }
}

/// Recognized request types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// Provision a new workspace
    InitProject,
    /// Create an empty file in the workspace cache
    CreateFile,
    /// Read a file from the workspace cache
    GetFile,
    /// Replace one line of a cached file
    UpdateFile,
    /// Delete a cached file
    DeleteFile,
    /// Create a folder in the workspace cache
    CreateFolder,
    /// Delete a folder from the workspace cache
    DeleteFolder,
    /// Ask for a terminal connection descriptor
    RequestTerminal,
    /// Snapshot the cached project tree
    GetTree,
    /// Tear the workspace down
    StopWorkspace,
}

impl RequestType {
    /// All request types, in declaration order
    pub const ALL: [RequestType; 10] = [
        RequestType::InitProject,
        RequestType::CreateFile,
        RequestType::GetFile,
        RequestType::UpdateFile,
        RequestType::DeleteFile,
        RequestType::CreateFolder,
        RequestType::DeleteFolder,
        RequestType::RequestTerminal,
        RequestType::GetTree,
        RequestType::StopWorkspace,
    ];

    /// Wire name of this request type
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::InitProject => "initProject",
            RequestType::CreateFile => "createFile",
            RequestType::GetFile => "getFile",
            RequestType::UpdateFile => "updateFile",
            RequestType::DeleteFile => "deleteFile",
            RequestType::CreateFolder => "createFolder",
            RequestType::DeleteFolder => "deleteFolder",
            RequestType::RequestTerminal => "requestTerminal",
            RequestType::GetTree => "getTree",
            RequestType::StopWorkspace => "stopWorkspace",
        }
    }

    /// Parse a wire name
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload validation, run after successful decoding
pub trait Validate {
    /// Check required fields and value ranges
    fn validate(&self) -> Result<(), ProtocolError>;
}

fn require(field: &str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::missing_field(field));
    }
    Ok(())
}

/// Payload of `initProject`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitProjectPayload {
    /// Project type (python, nodejs, golang, cpp, react)
    #[serde(default)]
    pub project_type: String,
}

impl Validate for InitProjectPayload {
    fn validate(&self) -> Result<(), ProtocolError> {
        require("projectType", &self.project_type)
    }
}

/// Payload of `createFile`, `getFile` and `deleteFile`
///
/// `filePath` is the directory relative to the project root; an empty
/// path addresses the root itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_path: String,
}

impl Validate for FilePayload {
    fn validate(&self) -> Result<(), ProtocolError> {
        require("fileName", &self.file_name)
    }
}

/// Payload of `updateFile`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFilePayload {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_path: String,
    /// 1-based line number
    #[serde(default)]
    pub line_number: usize,
    /// Base64-encoded replacement line
    #[serde(default)]
    pub line_content: String,
}

impl Validate for UpdateFilePayload {
    fn validate(&self) -> Result<(), ProtocolError> {
        require("fileName", &self.file_name)?;
        if self.line_number < 1 {
            return Err(ProtocolError::Validation(
                "field 'lineNumber' must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Payload of `createFolder`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderPayload {
    #[serde(default)]
    pub folder_name: String,
    #[serde(default)]
    pub folder_path: String,
}

impl Validate for CreateFolderPayload {
    fn validate(&self) -> Result<(), ProtocolError> {
        require("folderName", &self.folder_name)
    }
}

/// Payload of `deleteFolder`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFolderPayload {
    /// Folder path relative to the project root (wire name `filePath`)
    #[serde(rename = "filePath", default)]
    pub folder_path: String,
}

impl Validate for DeleteFolderPayload {
    fn validate(&self) -> Result<(), ProtocolError> {
        require("filePath", &self.folder_path)
    }
}

/// Payload of `requestTerminal`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTerminalPayload {
    /// Optional workspace the client believes it owns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl Validate for RequestTerminalPayload {
    fn validate(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Response envelope sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Whether the request succeeded
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Optional structured result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    /// Successful response without a payload
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: None,
        }
    }

    /// Successful response carrying a payload
    pub fn ok_with(message: impl Into<String>, payload: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: Some(payload),
        }
    }

    /// Structured failure response
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload: None,
        }
    }

    /// Encode as a JSON text frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<ProtocolError> for Response {
    fn from(err: ProtocolError) -> Self {
        Response::failure(err.to_string())
    }
}
