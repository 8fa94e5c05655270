//! Core trait definitions

mod cluster;
mod exec;
mod template;

pub use cluster::{
    selector_matches, ApiResource, ClusterApi, ClusterConnector, ExecTarget, GroupVersionKind,
    PodCondition, PodSnapshot, PodWatch, ResourceObject, WatchEvent,
};
pub use exec::{ExecIo, OutputSink, OutputStream, StdinSource, TerminalSizeSource};
pub use template::TemplateProvider;
