//! Cluster API backends

mod memory;

#[cfg(feature = "kube")]
mod kube;

pub use memory::{MemoryCluster, MemoryConnector};

#[cfg(feature = "kube")]
pub use self::kube::{KubeCluster, KubeConnector};
