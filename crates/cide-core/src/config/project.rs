//! Project catalog: which image and which manifests each project type gets

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::types::{ProjectType, ResourceNames};

/// One manifest template a project renders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    /// Logical name (`shellPod`, `service`, `ingress`)
    pub name: String,

    /// Resource kind, used to address the object on cleanup
    pub kind: String,

    /// Template file name, relative to the manifests directory
    pub template: String,

    /// Extra variables for this template only
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl ResourceTemplate {
    /// Create a template entry without extra variables
    pub fn new(name: &str, kind: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            template: template.to_string(),
            variables: BTreeMap::new(),
        }
    }
}

/// Everything needed to provision one project type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTemplate {
    /// Shell container image
    pub image: String,

    /// Manifests to apply, in order
    #[serde(default = "default_resources")]
    pub resources: Vec<ResourceTemplate>,
}

fn default_resources() -> Vec<ResourceTemplate> {
    vec![ResourceTemplate::new("shellPod", "Pod", "shell-pod.yaml")]
}

fn default_image(project: ProjectType) -> String {
    format!("ghcr.io/mudit06mah/shell-{}:latest", project.as_str())
}

/// Project templates keyed by project type name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectCatalog(BTreeMap<String, ProjectTemplate>);

impl Default for ProjectCatalog {
    fn default() -> Self {
        let mut projects = BTreeMap::new();
        for project in ProjectType::ALL {
            let mut resources = default_resources();
            if project == ProjectType::React {
                resources.push(ResourceTemplate::new("service", "Service", "service.yaml"));
                resources.push(ResourceTemplate::new("ingress", "Ingress", "ingress.yaml"));
            }
            projects.insert(
                project.as_str().to_string(),
                ProjectTemplate {
                    image: default_image(project),
                    resources,
                },
            );
        }
        Self(projects)
    }
}

impl ProjectCatalog {
    /// Look up a project type by wire name
    pub fn get(&self, name: &str) -> Option<&ProjectTemplate> {
        self.0.get(name)
    }

    /// Add or replace an entry
    pub fn insert(&mut self, project: ProjectType, template: ProjectTemplate) {
        self.0.insert(project.as_str().to_string(), template);
    }

    /// Number of configured project types
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that every entry names a known project type and has something
    /// to apply that cleanup can address again
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, template) in &self.0 {
            name.parse::<ProjectType>().map_err(ConfigError::Invalid)?;
            if template.image.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "project '{}' has no image",
                    name
                )));
            }
            if template.resources.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "project '{}' has no resources",
                    name
                )));
            }
            if let Some(resource) = template
                .resources
                .iter()
                .find(|r| !ResourceNames::derives_kind(&r.kind))
            {
                return Err(ConfigError::Invalid(format!(
                    "project '{}' resource '{}' has kind {}; only {} can be cleaned up",
                    name,
                    resource.name,
                    resource.kind,
                    ResourceNames::DERIVED_KINDS.join(", ")
                )));
            }
        }
        Ok(())
    }
}
