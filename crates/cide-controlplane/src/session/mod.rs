//! Client sessions and the workspaces they own

mod cleanup;
mod machine;
mod registry;

pub use cleanup::{cleanup_workspace, CleanupReport};
pub use machine::Session;
pub use registry::{WorkspaceHandle, WorkspaceRegistry};
