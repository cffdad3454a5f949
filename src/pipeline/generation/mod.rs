//! Generation capability seam.
//!
//! Every stage talks to the model through [`GenerationClient`]. The trait is
//! object-safe so one client instance can be shared across the three agents
//! as `Arc<dyn GenerationClient>`.

pub mod ollama;
pub mod mock;

pub use mock::MockGenerationClient;
pub use ollama::OllamaClient;

use thiserror::Error;

use super::types::ClinicalImage;
use crate::config::GenerationParams;

/// Preferred MedGemma tags, best first. A tag also matches installed
/// variants it prefixes, e.g. `medgemma:4b` matches `medgemma:4b-it-q4`.
pub const MEDGEMMA_MODELS: &[&str] = &[
    "medgemma:27b",
    "medgemma:4b",
    "medgemma:latest",
    "medgemma",
];

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Ollama is not running at {0}")]
    Connection(String),

    #[error("Ollama returned error (status {status}): {body}")]
    Backend { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Model returned empty output")]
    EmptyOutput,

    #[error("No compatible MedGemma model available")]
    NoModelAvailable,

    #[error("Generation failed: {0}")]
    Execution(String),
}

/// One generation call. `image` selects the multimodal path.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub system: &'a str,
    pub image: Option<&'a ClinicalImage>,
    pub params: GenerationParams,
}

impl<'a> GenerationRequest<'a> {
    pub fn text(model: &'a str, system: &'a str, prompt: &'a str, params: GenerationParams) -> Self {
        Self {
            model,
            prompt,
            system,
            image: None,
            params,
        }
    }

    pub fn with_image(mut self, image: &'a ClinicalImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn is_multimodal(&self) -> bool {
        self.image.is_some()
    }
}

/// Text (and optional image) to text inference.
///
/// Implementations do not retry. Callers must not issue overlapping calls
/// against a client that fronts a single model instance.
pub trait GenerationClient: Send + Sync {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError>;

    fn list_models(&self) -> Result<Vec<String>, GenerationError>;

    fn is_model_available(&self, model: &str) -> Result<bool, GenerationError> {
        Ok(self.list_models()?.iter().any(|m| m.starts_with(model)))
    }
}

/// Pick the model to run. Always returns a name the backend reports as
/// installed.
///
/// A non-blank `preferred` tag wins when it matches an installed model,
/// exactly or as a prefix. Otherwise the [`MEDGEMMA_MODELS`] list is tried:
/// exact matches across the whole list first, then prefix matches.
pub fn resolve_model(
    client: &dyn GenerationClient,
    preferred: Option<&str>,
) -> Result<String, GenerationError> {
    let available = client.list_models()?;

    if let Some(preferred) = preferred.map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(installed) =
            installed_exact(&available, preferred).or_else(|| installed_prefix(&available, preferred))
        {
            return Ok(installed.clone());
        }
        tracing::warn!(model = preferred, "Configured model not available, falling back");
    }

    MEDGEMMA_MODELS
        .iter()
        .find_map(|tag| installed_exact(&available, tag))
        .or_else(|| {
            MEDGEMMA_MODELS
                .iter()
                .find_map(|tag| installed_prefix(&available, tag))
        })
        .cloned()
        .ok_or(GenerationError::NoModelAvailable)
}

fn installed_exact<'a>(available: &'a [String], tag: &str) -> Option<&'a String> {
    available.iter().find(|m| m.as_str() == tag)
}

fn installed_prefix<'a>(available: &'a [String], tag: &str) -> Option<&'a String> {
    available.iter().find(|m| m.starts_with(tag))
}
