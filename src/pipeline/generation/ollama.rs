use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{GenerationClient, GenerationError, GenerationRequest};
use crate::config::{PipelineConfig, DEFAULT_OLLAMA_URL, DEFAULT_TIMEOUT_SECS};

/// Ollama HTTP client for local MedGemma inference.
///
/// Text-only requests go to `/api/generate`. Image requests go to
/// `/api/chat`, which chat-template models like MedGemma require when
/// images are attached.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, GenerationError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GenerationError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        })
    }

    /// Localhost:11434 with the default timeout.
    pub fn default_local() -> Result<Self, GenerationError> {
        Self::new(DEFAULT_OLLAMA_URL, DEFAULT_TIMEOUT_SECS)
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, GenerationError> {
        Self::new(&config.base_url, config.timeout_secs)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error) -> GenerationError {
        if e.is_connect() {
            GenerationError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            GenerationError::HttpClient(format!("Request timed out after {}s", self.timeout_secs))
        } else {
            GenerationError::HttpClient(e.to_string())
        }
    }

    fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, GenerationError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GenerationError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .map_err(|e| GenerationError::ResponseParsing(e.to_string()))
    }
}

// ──────────────────────────────────────────────
// Wire types
// ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Request body for `/api/generate`.
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Request body for `/api/chat`.
#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaChatMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatResponseMessage,
}

#[derive(Deserialize)]
struct OllamaChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

fn options_for(request: &GenerationRequest<'_>) -> OllamaOptions {
    OllamaOptions {
        temperature: request.params.temperature,
        num_predict: request.params.max_output_length,
    }
}

fn chat_body<'a>(request: &GenerationRequest<'a>) -> OllamaChatRequest<'a> {
    let mut messages = Vec::with_capacity(2);
    if !request.system.is_empty() {
        messages.push(OllamaChatMessage {
            role: "system",
            content: request.system,
            images: None,
        });
    }
    messages.push(OllamaChatMessage {
        role: "user",
        content: request.prompt,
        images: request.image.map(|image| vec![image.to_base64()]),
    });

    OllamaChatRequest {
        model: request.model,
        messages,
        stream: false,
        options: options_for(request),
    }
}

impl GenerationClient for OllamaClient {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        let text = if request.is_multimodal() {
            let parsed: OllamaChatResponse = self.post("/api/chat", &chat_body(request))?;
            parsed.message.content
        } else {
            let body = OllamaGenerateRequest {
                model: request.model,
                prompt: request.prompt,
                system: request.system,
                stream: false,
                options: options_for(request),
            };
            let parsed: OllamaGenerateResponse = self.post("/api/generate", &body)?;
            parsed.response
        };

        tracing::debug!(
            model = request.model,
            multimodal = request.is_multimodal(),
            output_len = text.len(),
            "Ollama generation complete"
        );
        Ok(text)
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.client.get(&url).send().map_err(|e| {
            if e.is_connect() {
                GenerationError::Connection(self.base_url.clone())
            } else {
                GenerationError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GenerationError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaTagsResponse = response
            .json()
            .map_err(|e| GenerationError::ResponseParsing(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationParams;
    use crate::pipeline::{ClinicalImage, Stage};

    #[test]
    fn constructor_trims_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/", 60).unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434");
        assert_eq!(client.timeout_secs, 60);
    }

    #[test]
    fn from_config_uses_configured_endpoint() {
        let config = PipelineConfig {
            base_url: "http://gpu-box:11434".into(),
            timeout_secs: 42,
            ..Default::default()
        };
        let client = OllamaClient::from_config(&config).unwrap();
        assert_eq!(client.base_url(), "http://gpu-box:11434");
        assert_eq!(client.timeout_secs, 42);
    }

    #[test]
    fn generate_body_carries_stage_params() {
        let params = GenerationParams::default_for(Stage::ClinicalReasoning);
        let request = GenerationRequest::text("medgemma", "", "hello", params);
        let body = OllamaGenerateRequest {
            model: request.model,
            prompt: request.prompt,
            system: request.system,
            stream: false,
            options: options_for(&request),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["options"]["num_predict"], 1536);
        assert!((json["options"]["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
        assert!(json.get("system").is_none());
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn chat_body_attaches_image_to_user_message() {
        let params = GenerationParams::default_for(Stage::VisualAnalysis);
        let image = ClinicalImage::from_bytes(vec![1, 2, 3]);
        let request =
            GenerationRequest::text("medgemma", "You describe images.", "Describe.", params)
                .with_image(&image);
        let json = serde_json::to_value(chat_body(&request)).unwrap();
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0].get("images").is_none());
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["images"][0], "AQID");
    }

    #[test]
    fn unreachable_backend_is_connection_error() {
        // Port 9 (discard) is closed on test machines.
        let client = OllamaClient::new("http://127.0.0.1:9", 2).unwrap();
        assert!(matches!(
            client.list_models(),
            Err(GenerationError::Connection(_)) | Err(GenerationError::HttpClient(_))
        ));
    }
}
