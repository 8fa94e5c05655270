//! Core error types for the control plane

use cide_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the control plane
#[derive(Error, Debug)]
pub enum CideError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cluster API error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Manifest reconciliation error
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Readiness wait error
    #[error("Readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    /// Template error
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Workspace cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by a cluster API backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// Create refused because the object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Object not found
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Update carried a stale resourceVersion
    #[error("conflict updating {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Request rejected as invalid
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Operation not supported by this backend
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Could not build a client
    #[error("failed to connect to cluster: {0}")]
    Connect(String),

    /// Any other API failure
    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    /// Whether this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    /// Whether this error means the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    /// Whether this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

/// Errors from rendering and applying manifests
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Template file could not be read
    #[error("failed to read template file {path:?}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest document is not valid YAML/JSON
    #[error("failed to decode manifest: {0}")]
    Decode(String),

    /// Manifest document lacks a required field
    #[error("manifest is missing {0}")]
    MissingField(&'static str),

    /// No resource type registered for a group/version/kind, even after a rediscovery
    #[error("no resource mapping for {api_version} {kind}")]
    UnresolvedKind { api_version: String, kind: String },

    /// Kind not present in the static deletion table
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// Project type has no catalog entry
    #[error("unsupported project type: {0}")]
    UnsupportedProject(String),

    /// Cluster call failed
    #[error("{action} {kind} {name}: {source}")]
    Cluster {
        action: &'static str,
        kind: String,
        name: String,
        #[source]
        source: ClusterError,
    },

    /// Discovery call failed
    #[error("discovery failed: {0}")]
    Discovery(#[source] ClusterError),
}

/// Errors from waiting for a pod to become ready
#[derive(Error, Debug)]
pub enum ReadinessError {
    /// No matching pod became ready in time
    #[error("timed out after {timeout:?} waiting for pod with selector {selector}")]
    Timeout {
        selector: String,
        timeout: std::time::Duration,
    },

    /// The watch stream ended before a ready pod was seen
    #[error("watch closed while waiting for pod with selector {0}")]
    WatchClosed(String),

    /// Cluster call failed
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

impl ReadinessError {
    /// Whether a caller may reasonably retry the wait
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReadinessError::WatchClosed(_))
    }
}

/// Errors from materializing a project template
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Template source does not exist for this project type
    #[error("template not found: {0:?}")]
    NotFound(PathBuf),

    /// Project type has no template
    #[error("unsupported project type: {0}")]
    Unsupported(String),

    /// Copy failed
    #[error("failed to copy template into {path:?}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the per-workspace file cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// Path escapes the workspace root
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// File or folder does not exist
    #[error("File does not exist: {0}")]
    NotFound(String),

    /// Line number beyond the end of the file
    #[error("Line number exceeds file length")]
    LineOutOfRange,

    /// Line content is not valid base64
    #[error("Error decoding line content: {0}")]
    Decode(String),

    /// Underlying I/O failure
    #[error("{action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Session-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No cluster client yet (no successful `initProject`)
    #[error("K8s client not initialized")]
    ClientNotInitialized,

    /// No workspace bound to the session
    #[error("No workspace initialized")]
    NoWorkspace,

    /// Workspace is not in a state that permits the request
    #[error("Workspace is {0}")]
    InvalidState(String),

    /// Workspace id unknown to the registry
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// A workspace is already bound to the session
    #[error("Workspace already initialized")]
    AlreadyInitialized,

    /// The connection closed while the request was in flight
    #[error("Provisioning cancelled")]
    Cancelled,
}

/// Errors surfaced to the exec stream driver by the terminal bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecIoError {
    /// The client connection is gone; no further writes will be attempted
    #[error("terminal connection closed")]
    Closed,

    /// Writing a frame failed
    #[error("failed to send terminal frame: {0}")]
    Send(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
