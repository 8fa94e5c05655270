//! Core domain types

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Alphabet workspace ids are drawn from.
///
/// Lowercase only: ids end up in pod names and DNS labels.
pub const WORKSPACE_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Default workspace id length
pub const WORKSPACE_ID_LENGTH: usize = 10;

/// Opaque identifier of a workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Generate a random id of the given length
    pub fn generate(len: usize) -> Self {
        Self::generate_with(&mut rand::thread_rng(), len)
    }

    /// Generate a random id from the given RNG
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Self {
        let id = (0..len)
            .map(|_| WORKSPACE_ID_ALPHABET[rng.gen_range(0..WORKSPACE_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Parse an id received from a client
    ///
    /// Returns `None` if the value contains characters outside the id
    /// alphabet, so a parsed id is always safe to splice into resource
    /// names and label selectors.
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() || !value.bytes().all(|b| WORKSPACE_ID_ALPHABET.contains(&b)) {
            return None;
        }
        Some(Self(value.to_string()))
    }

    /// Get the raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported project types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Python,
    Nodejs,
    Golang,
    Cpp,
    React,
}

impl ProjectType {
    /// All supported project types
    pub const ALL: [ProjectType; 5] = [
        ProjectType::Python,
        ProjectType::Nodejs,
        ProjectType::Golang,
        ProjectType::Cpp,
        ProjectType::React,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Python => "python",
            ProjectType::Nodejs => "nodejs",
            ProjectType::Golang => "golang",
            ProjectType::Cpp => "cpp",
            ProjectType::React => "react",
        }
    }

    /// Directory name of the project skeleton in the template store
    pub fn template_prefix(&self) -> &'static str {
        match self {
            ProjectType::Nodejs => "node",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<_> = Self::ALL.iter().map(|p| p.as_str()).collect();
                format!(
                    "projectType must be one of [{}], got '{}'",
                    allowed.join(" "),
                    s
                )
            })
    }
}

/// Workspace lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    /// Id reserved, nothing provisioned yet
    Created,
    /// Template fetched and manifests being applied
    Provisioning,
    /// Pod is running and ready
    Ready,
    /// Cleanup in progress
    Terminating,
    /// Cleanup finished
    Terminated,
    /// Provisioning failed terminally
    Failed,
}

impl WorkspaceState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: WorkspaceState) -> bool {
        use WorkspaceState::*;
        matches!(
            (self, next),
            (Created, Provisioning)
                | (Created, Terminating)
                | (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Provisioning, Terminating)
                | (Ready, Terminating)
                | (Failed, Terminating)
                | (Terminating, Terminated)
        )
    }

    /// Whether cleanup has started or finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkspaceState::Terminating | WorkspaceState::Terminated)
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceState::Created => "created",
            WorkspaceState::Provisioning => "provisioning",
            WorkspaceState::Ready => "ready",
            WorkspaceState::Terminating => "terminating",
            WorkspaceState::Terminated => "terminated",
            WorkspaceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cluster resource names of a workspace
///
/// A pure function of the workspace id, so a workspace's resources can be
/// addressed (and cleaned up) without any other stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// Shell pod name
    pub pod: String,
    /// Service name
    pub service: String,
    /// Ingress name
    pub ingress: String,
    /// Label selector matching the workspace's pods
    pub label_selector: String,
}

impl ResourceNames {
    /// Kinds whose names derive from the workspace id
    pub const DERIVED_KINDS: &'static [&'static str] = &["Pod", "Service", "Ingress"];

    /// Whether resources of `kind` can be addressed from the id alone
    pub fn derives_kind(kind: &str) -> bool {
        Self::DERIVED_KINDS
            .iter()
            .any(|k| k.eq_ignore_ascii_case(kind))
    }

    /// Derive resource names from a workspace id
    pub fn for_workspace(id: &WorkspaceId) -> Self {
        Self {
            pod: format!("shell-{}", id),
            service: format!("svc-{}", id),
            ingress: format!("ingress-{}", id),
            label_selector: format!("workspace={}", id),
        }
    }

    /// Resource name for a kind, if the workspace owns one
    pub fn name_for_kind(&self, kind: &str) -> Option<&str> {
        match kind.to_ascii_lowercase().as_str() {
            "pod" => Some(&self.pod),
            "service" => Some(&self.service),
            "ingress" => Some(&self.ingress),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_workspace_id_shape() {
        let id = WorkspaceId::generate(WORKSPACE_ID_LENGTH);
        assert_eq!(id.as_str().len(), 10);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_workspace_ids_vary() {
        let ids: HashSet<_> = (0..100).map(|_| WorkspaceId::generate(10)).collect();
        assert!(ids.len() > 95);
    }

    #[test]
    fn test_workspace_id_parse_rejects_foreign_characters() {
        assert!(WorkspaceId::parse("abc123").is_some());
        assert!(WorkspaceId::parse("ABC").is_none());
        assert!(WorkspaceId::parse("a,b").is_none());
        assert!(WorkspaceId::parse("").is_none());
    }

    #[test]
    fn test_project_type_parse() {
        assert_eq!("python".parse::<ProjectType>().unwrap(), ProjectType::Python);
        assert_eq!(ProjectType::Nodejs.template_prefix(), "node");
        let err = "cobol".parse::<ProjectType>().unwrap_err();
        assert!(err.contains("cobol"));
    }

    #[test]
    fn test_state_transitions() {
        use WorkspaceState::*;
        assert!(Created.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Terminating));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Terminated.can_transition_to(Terminating));
    }

    #[test]
    fn test_resource_names_are_derived() {
        let id = WorkspaceId::parse("k3x9q0abcd").unwrap();
        let names = ResourceNames::for_workspace(&id);
        assert_eq!(names.pod, "shell-k3x9q0abcd");
        assert_eq!(names.label_selector, "workspace=k3x9q0abcd");
        assert_eq!(names.name_for_kind("Ingress"), Some("ingress-k3x9q0abcd"));
        assert_eq!(names.name_for_kind("ConfigMap"), None);
        for kind in ResourceNames::DERIVED_KINDS {
            assert!(names.name_for_kind(kind).is_some());
            assert!(ResourceNames::derives_kind(&kind.to_ascii_lowercase()));
        }
        assert!(!ResourceNames::derives_kind("ConfigMap"));
        assert_eq!(ResourceNames::for_workspace(&id), names);
    }
}
