//! cide-core: Core abstractions and configuration for the cloud IDE control plane
//!
//! This crate provides the shared workspace types, the error taxonomy,
//! configuration structures, and the traits behind which the control plane
//! talks to its external collaborators (the cluster API, the template
//! provider, and the exec stream contract).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::CideError;
pub use types::{ProjectType, ResourceNames, WorkspaceId, WorkspaceState};
