//! Extraction prompts.
//!
//! Prompts live in a YAML catalog loaded once at startup and shared with the
//! pipeline as an `Arc<PromptCatalog>`. A catalog that does not resolve its
//! own default template is rejected at load time, so a running server can
//! always produce a prompt for an unknown document type.
//!
//! ```yaml
//! default_prompt: doc_extraction_prompt
//! document_types:
//!   Bill Reimbursment: reimbursement_extraction_prompt
//! prompts:
//!   doc_extraction_prompt: "Extract ..."
//!   reimbursement_extraction_prompt: "Extract ..."
//! ```

use crate::error::PipelineError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// The catalog shipped with the crate, used when no file is configured.
pub const BUILTIN_CATALOG: &str = include_str!("../prompts/prompts.yaml");

/// Document type recorded when the client sends none.
pub const DEFAULT_DOCUMENT_TYPE: &str = "docextraction";

#[derive(Debug, Clone, Deserialize)]
pub struct PromptCatalog {
    /// Template key used when no document type matches.
    default_prompt: String,
    /// Document-type label → template key.
    #[serde(default)]
    document_types: HashMap<String, String>,
    /// Template key → template text.
    prompts: HashMap<String, String>,
}

impl PromptCatalog {
    /// Load and validate a catalog file. Missing file, bad YAML, and an
    /// unresolvable default are all [`PipelineError::Misconfigured`].
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Misconfigured(format!(
                "cannot read prompt catalog {}: {e}",
                path.display()
            ))
        })?;
        let catalog = Self::from_yaml_str(&text)?;
        info!(
            path = %path.display(),
            prompts = catalog.prompts.len(),
            document_types = catalog.document_types.len(),
            "Prompt catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, PipelineError> {
        let catalog: Self = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::Misconfigured(format!("invalid prompt catalog: {e}")))?;
        catalog.default_template()?;
        Ok(catalog)
    }

    pub fn builtin() -> Result<Self, PipelineError> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    /// Pick the prompt for a run.
    ///
    /// Order: a non-blank override, then the template mapped from
    /// `document_type`, then the default template.
    pub fn resolve(
        &self,
        document_type: Option<&str>,
        prompt_override: Option<&str>,
    ) -> Result<String, PipelineError> {
        if let Some(text) = prompt_override.filter(|t| !t.trim().is_empty()) {
            debug!("Using caller-supplied prompt");
            return Ok(text.to_string());
        }

        let mapped = document_type
            .and_then(|label| self.document_types.get(label.trim()))
            .and_then(|key| self.template(key));
        match mapped {
            Some(text) => Ok(text.to_string()),
            None => self.default_template().map(str::to_string),
        }
    }

    fn template(&self, key: &str) -> Option<&str> {
        self.prompts
            .get(key)
            .map(String::as_str)
            .filter(|t| !t.trim().is_empty())
    }

    fn default_template(&self) -> Result<&str, PipelineError> {
        self.template(&self.default_prompt).ok_or_else(|| {
            PipelineError::Misconfigured(format!(
                "default prompt '{}' is missing or empty",
                self.default_prompt
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
default_prompt: general
document_types:
  Bill Reimbursment: bills
  docextraction: general
prompts:
  general: "extract everything"
  bills: "extract the bill"
"#;

    #[test]
    fn builtin_catalog_is_valid() {
        let catalog = PromptCatalog::builtin().unwrap();
        let bill = catalog.resolve(Some("Bill Reimbursment"), None).unwrap();
        let general = catalog.resolve(None, None).unwrap();
        assert_ne!(bill, general);
        assert!(bill.contains("reimbursement"));
    }

    #[test]
    fn override_wins_when_not_blank() {
        let catalog = PromptCatalog::from_yaml_str(CATALOG).unwrap();
        assert_eq!(
            catalog.resolve(Some("Bill Reimbursment"), Some("custom")).unwrap(),
            "custom"
        );
        assert_eq!(
            catalog.resolve(Some("Bill Reimbursment"), Some("   ")).unwrap(),
            "extract the bill"
        );
    }

    #[test]
    fn unknown_type_falls_back_to_default() {
        let catalog = PromptCatalog::from_yaml_str(CATALOG).unwrap();
        assert_eq!(catalog.resolve(Some("passport"), None).unwrap(), "extract everything");
        assert_eq!(catalog.resolve(None, None).unwrap(), "extract everything");
    }

    #[test]
    fn mapping_to_missing_template_falls_back() {
        let catalog = PromptCatalog::from_yaml_str(
            "default_prompt: a\ndocument_types:\n  x: nope\nprompts:\n  a: \"A\"\n",
        )
        .unwrap();
        assert_eq!(catalog.resolve(Some("x"), None).unwrap(), "A");
    }

    #[test]
    fn missing_default_is_rejected() {
        let err = PromptCatalog::from_yaml_str("default_prompt: a\nprompts:\n  b: \"B\"\n")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Misconfigured(_)));

        let err = PromptCatalog::from_yaml_str("default_prompt: a\nprompts:\n  a: \"  \"\n")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Misconfigured(_)));
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = PromptCatalog::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, PipelineError::Misconfigured(_)));
    }
}
