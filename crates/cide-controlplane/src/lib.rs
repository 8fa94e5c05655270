//! cide-controlplane: Workspace provisioning and terminal bridging
//!
//! The control plane accepts browser connections, provisions a sandboxed
//! shell pod per workspace, serves file requests against a local copy of
//! the project, and bridges terminal connections to the pod's shell.

pub mod cache;
pub mod cluster;
pub mod readiness;
pub mod reconciler;
pub mod server;
pub mod session;
pub mod state;
pub mod templates;
pub mod terminal;

pub use readiness::ReadinessWaiter;
pub use reconciler::{Reconciler, RestMapper};
pub use server::Gateway;
pub use session::{Session, WorkspaceRegistry};
pub use state::ControlPlaneState;
