//! Manifest templates
//!
//! Templates are plain YAML files with `{{NAME}}` tokens. Rendering is a
//! literal substitution; no escaping or expression evaluation happens.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cide_core::error::ReconcileError;
use cide_core::traits::ResourceObject;

/// A template file plus the variables to substitute into it
#[derive(Debug, Clone)]
pub struct ManifestTemplate {
    pub source: PathBuf,
    pub variables: BTreeMap<String, String>,
}

impl ManifestTemplate {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            variables: BTreeMap::new(),
        }
    }

    /// Add or replace a variable
    pub fn with_variable(mut self, name: &str, value: impl Into<String>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    /// Add every variable from `variables`, replacing existing ones
    pub fn with_variables(mut self, variables: &BTreeMap<String, String>) -> Self {
        self.variables
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Read the template file and substitute its variables
    pub async fn render(&self) -> Result<RenderedManifest, ReconcileError> {
        let template = tokio::fs::read_to_string(&self.source)
            .await
            .map_err(|source| ReconcileError::TemplateRead {
                path: self.source.clone(),
                source,
            })?;
        Ok(RenderedManifest::new(
            display_name(&self.source),
            render(&template, &self.variables),
        ))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Substitute `{{NAME}}` tokens in one pass
///
/// Substituted values are never rescanned. Tokens with no variable are
/// left as written.
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        match variables.get(&after[..end]) {
            Some(value) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Rendered manifest text, possibly holding several YAML documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedManifest {
    /// Where the text came from, for reporting
    pub source: String,
    pub text: String,
}

impl RenderedManifest {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }

    /// Decode each YAML document in order
    ///
    /// Empty documents are skipped. A syntax error ends the sequence since
    /// the parser cannot resynchronize after it.
    pub fn documents(&self) -> Vec<Result<ResourceObject, ReconcileError>> {
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&self.text) {
            match Value::deserialize(document) {
                Ok(Value::Null) => continue,
                Ok(value @ Value::Object(_)) => documents.push(Ok(ResourceObject(value))),
                Ok(_) => documents.push(Err(ReconcileError::Decode(
                    "document is not a mapping".to_string(),
                ))),
                Err(e) => {
                    documents.push(Err(ReconcileError::Decode(e.to_string())));
                    break;
                }
            }
        }
        documents
    }
}
