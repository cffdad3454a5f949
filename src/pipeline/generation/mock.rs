use std::sync::Mutex;

use super::{GenerationClient, GenerationError, GenerationRequest};
use crate::config::GenerationParams;

/// What the mock saw for one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub has_image: bool,
    pub params: GenerationParams,
}

/// Scripted generation client for tests.
///
/// Returns `responses[i]` on the i-th call, repeating the last entry once
/// the script runs out. A failure can be injected at a chosen call index.
pub struct MockGenerationClient {
    responses: Vec<String>,
    available_models: Vec<String>,
    fail_on_call: Option<(usize, String)>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockGenerationClient {
    pub fn new(response: &str) -> Self {
        Self::scripted(vec![response.to_string()])
    }

    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            responses,
            available_models: vec!["medgemma:latest".to_string()],
            fail_on_call: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.available_models = models;
        self
    }

    /// Fail the call at zero-based `index` with `GenerationError::Execution`.
    pub fn failing_on(mut self, index: usize, reason: &str) -> Self {
        self.fail_on_call = Some((index, reason.to_string()));
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl GenerationClient for MockGenerationClient {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        let index = {
            let mut requests = self
                .requests
                .lock()
                .map_err(|e| GenerationError::Execution(e.to_string()))?;
            requests.push(RecordedRequest {
                model: request.model.to_string(),
                system: request.system.to_string(),
                prompt: request.prompt.to_string(),
                has_image: request.is_multimodal(),
                params: request.params,
            });
            requests.len() - 1
        };

        if let Some((fail_index, reason)) = &self.fail_on_call {
            if *fail_index == index {
                return Err(GenerationError::Execution(reason.clone()));
            }
        }

        Ok(self
            .responses
            .get(index)
            .or_else(|| self.responses.last())
            .cloned()
            .unwrap_or_default())
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        Ok(self.available_models.clone())
    }
}
