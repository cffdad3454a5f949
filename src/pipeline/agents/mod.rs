//! Stage agents: one generation call each, parsed into a typed record.
//!
//! Agents never hand back a partially built record. Unparsable text degrades
//! to documented defaults; a failed generation call or rejected input
//! surfaces as [`StageError`] naming the stage.

pub mod visual;
pub mod reasoning;
pub mod report;

pub use reasoning::{ClinicalReasoningAgent, ReasoningInput};
pub use report::PatientReportAgent;
pub use visual::{VisualAnalysisAgent, VisualInput};

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::generation::{GenerationClient, GenerationError, GenerationRequest};
use super::parsing::clean_model_output;
use super::types::ClinicalImage;
use super::Stage;
use crate::config::GenerationParams;

/// Malformed stage input, detected before any generation call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Clinical image is empty")]
    EmptyImage,

    #[error("Unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    #[error("Implausible patient age: {0}")]
    ImplausibleAge(u32),
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("{stage}: invalid input: {source}")]
    Validation {
        stage: Stage,
        source: ValidationError,
    },

    #[error("{stage}: {source}")]
    Generation {
        stage: Stage,
        source: GenerationError,
    },
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Validation { stage, .. } | Self::Generation { stage, .. } => *stage,
        }
    }
}

/// Shared capability of the three agents: typed input in, typed record out.
pub trait StageAgent {
    type Input<'a>;
    type Output: Serialize;

    fn stage(&self) -> Stage;

    fn run(&self, input: Self::Input<'_>) -> Result<Self::Output, StageError>;
}

/// Client handle, model tag and sampling params common to every agent.
#[derive(Clone)]
pub(crate) struct AgentCore {
    client: Arc<dyn GenerationClient>,
    model: String,
    params: GenerationParams,
}

impl AgentCore {
    pub(crate) fn new(client: Arc<dyn GenerationClient>, model: &str, stage: Stage) -> Self {
        Self {
            client,
            model: model.to_string(),
            params: GenerationParams::default_for(stage),
        }
    }

    pub(crate) fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn params(&self) -> GenerationParams {
        self.params
    }

    pub(crate) fn set_params(&mut self, params: GenerationParams) {
        self.params = params;
    }

    /// Run one generation call. Output that is blank once model control
    /// tokens are stripped counts as a failed call.
    pub(crate) fn generate(
        &self,
        stage: Stage,
        system: &str,
        prompt: &str,
        image: Option<&ClinicalImage>,
    ) -> Result<String, StageError> {
        let mut request = GenerationRequest::text(&self.model, system, prompt, self.params);
        if let Some(image) = image {
            request = request.with_image(image);
        }

        let raw = self
            .client
            .generate(&request)
            .map_err(|source| StageError::Generation { stage, source })?;

        if clean_model_output(&raw).trim().is_empty() {
            return Err(StageError::Generation {
                stage,
                source: GenerationError::EmptyOutput,
            });
        }
        Ok(raw)
    }
}

/// Append `Label: value` when the value is non-blank.
pub(crate) fn push_line(lines: &mut Vec<String>, label: &str, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        lines.push(format!("{label}: {value}"));
    }
}

/// Append `Label: a, b, c` when the list is non-empty.
pub(crate) fn push_list(lines: &mut Vec<String>, label: &str, items: &[String]) {
    if !items.is_empty() {
        lines.push(format!("{label}: {}", items.join(", ")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::generation::MockGenerationClient;

    #[test]
    fn stage_error_reports_stage() {
        let err = StageError::Generation {
            stage: Stage::ClinicalReasoning,
            source: GenerationError::Execution("CUDA out of memory".into()),
        };
        assert_eq!(err.stage(), Stage::ClinicalReasoning);
        assert_eq!(
            err.to_string(),
            "clinical_reasoning: Generation failed: CUDA out of memory"
        );

        let err = StageError::Validation {
            stage: Stage::VisualAnalysis,
            source: ValidationError::EmptyImage,
        };
        assert_eq!(err.stage(), Stage::VisualAnalysis);
        assert!(err.to_string().contains("invalid input"));
    }

    #[test]
    fn blank_output_is_a_generation_failure() {
        let core = AgentCore::new(
            Arc::new(MockGenerationClient::new("<unused94>thought\n  ")),
            "medgemma",
            Stage::PatientReport,
        );
        let err = core.generate(Stage::PatientReport, "", "prompt", None).unwrap_err();
        assert!(matches!(
            err,
            StageError::Generation {
                stage: Stage::PatientReport,
                source: GenerationError::EmptyOutput
            }
        ));
    }

    #[test]
    fn core_uses_stage_defaults() {
        let core = AgentCore::new(
            Arc::new(MockGenerationClient::new("x")),
            "medgemma",
            Stage::ClinicalReasoning,
        );
        assert_eq!(core.params(), GenerationParams::default_for(Stage::ClinicalReasoning));
        assert_eq!(core.model(), "medgemma");
    }

    #[test]
    fn line_helpers_skip_blank_values() {
        let mut lines = Vec::new();
        push_line(&mut lines, "Age", "45");
        push_line(&mut lines, "Sex", "  ");
        push_list(&mut lines, "Colors", &[]);
        push_list(&mut lines, "Morphology", &["papule".into(), "raised".into()]);
        assert_eq!(lines, vec!["Age: 45", "Morphology: papule, raised"]);
    }
}
