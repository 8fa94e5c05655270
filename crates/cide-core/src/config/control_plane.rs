//! Control plane configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::project::ProjectCatalog;
use super::serde_utils::duration;
use crate::error::ConfigError;
use crate::types::WORKSPACE_ID_LENGTH;

/// Which cluster API implementation to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    /// A real Kubernetes cluster (requires the `kube` feature)
    Kubernetes,
    /// The in-process sandbox cluster
    Memory,
}

impl std::str::FromStr for ClusterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Configuration for the control plane daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Address the WebSocket gateway binds to
    pub bind_address: String,

    /// Namespace all workspace resources live in
    pub namespace: String,

    /// Root of the per-workspace file caches
    pub cache_dir: PathBuf,

    /// Root of the project skeletons, one directory per template prefix
    pub templates_dir: PathBuf,

    /// Directory holding the manifest templates
    pub manifests_dir: PathBuf,

    /// How long `initProject` waits for the shell pod
    #[serde(with = "duration")]
    pub readiness_timeout: Duration,

    /// How long `requestTerminal` waits when locating the shell pod
    #[serde(with = "duration")]
    pub terminal_lookup_timeout: Duration,

    /// Container to exec into
    pub shell_container: String,

    /// Command run on the terminal connection
    pub shell_command: Vec<String>,

    /// Domain appended to workspace ids to form ingress hosts
    pub ingress_domain: String,

    /// Length of generated workspace ids
    pub workspace_id_length: usize,

    /// Cluster API backend
    pub backend: ClusterBackend,

    /// Project catalog
    pub projects: ProjectCatalog,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            namespace: "cloud-ide".to_string(),
            cache_dir: std::env::temp_dir().join("cloud-ide").join("cache"),
            templates_dir: PathBuf::from("./templates"),
            manifests_dir: PathBuf::from("./manifests"),
            readiness_timeout: Duration::from_secs(30),
            terminal_lookup_timeout: Duration::from_secs(1),
            shell_container: "shell".to_string(),
            shell_command: vec!["/bin/bash".to_string()],
            ingress_domain: "localhost".to_string(),
            workspace_id_length: WORKSPACE_ID_LENGTH,
            backend: ClusterBackend::Kubernetes,
            projects: ProjectCatalog::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// Recognized keys: `WS_PORT`, `CACHE_DIR`, `TEMPLATES_DIR`,
    /// `MANIFESTS_DIR`, `CIDE_NAMESPACE`, `CIDE_READINESS_TIMEOUT`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("WS_PORT").filter(|p| !p.is_empty()) {
            self.bind_address = format!("0.0.0.0:{}", port);
        }
        if let Some(dir) = lookup("CACHE_DIR").filter(|d| !d.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("TEMPLATES_DIR").filter(|d| !d.is_empty()) {
            self.templates_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("MANIFESTS_DIR").filter(|d| !d.is_empty()) {
            self.manifests_dir = PathBuf::from(dir);
        }
        if let Some(ns) = lookup("CIDE_NAMESPACE").filter(|n| !n.is_empty()) {
            self.namespace = ns;
        }
        if let Some(raw) = lookup("CIDE_READINESS_TIMEOUT") {
            match duration::parse(&raw) {
                Some(timeout) => self.readiness_timeout = timeout,
                None => tracing::warn!("Ignoring invalid CIDE_READINESS_TIMEOUT '{}'", raw),
            }
        }
    }

    /// Check invariants the rest of the system relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }
        if self.readiness_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "readiness_timeout must be positive".into(),
            ));
        }
        if !(4..=32).contains(&self.workspace_id_length) {
            return Err(ConfigError::Invalid(format!(
                "workspace_id_length must be between 4 and 32, got {}",
                self.workspace_id_length
            )));
        }
        if self.shell_command.is_empty() {
            return Err(ConfigError::Invalid("shell_command must not be empty".into()));
        }
        self.projects.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControlPlaneConfig::default();
        config.validate().unwrap();
        assert_eq!(config.namespace, "cloud-ide");
        assert_eq!(config.readiness_timeout, Duration::from_secs(30));
        assert_eq!(config.workspace_id_length, 10);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WS_PORT", "9000"),
            ("CACHE_DIR", "/var/cache/ide"),
            ("CIDE_NAMESPACE", ""),
            ("CIDE_READINESS_TIMEOUT", "1500ms"),
        ]
        .into_iter()
        .collect();

        let mut config = ControlPlaneConfig::default();
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/ide"));
        // Empty values don't override
        assert_eq!(config.namespace, "cloud-ide");
        assert_eq!(config.readiness_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ControlPlaneConfig = toml::from_str(
            r#"
            namespace = "staging"
            readiness_timeout = 90
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.namespace, "staging");
        assert_eq!(config.readiness_timeout, Duration::from_secs(90));
        assert_eq!(config.backend, ClusterBackend::Memory);
        assert_eq!(config.shell_container, "shell");
        assert!(config.projects.get("python").is_some());
    }

    #[test]
    fn test_validate_rejects_bad_id_length() {
        let config = ControlPlaneConfig {
            workspace_id_length: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("memory".parse::<ClusterBackend>(), Ok(ClusterBackend::Memory));
        assert_eq!("k8s".parse::<ClusterBackend>(), Ok(ClusterBackend::Kubernetes));
        assert!("nomad".parse::<ClusterBackend>().is_err());
    }
}
