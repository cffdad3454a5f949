use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::Stage;

/// Application-level constants
pub const APP_NAME: &str = "MedLens";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default generation timeout (seconds). MedGemma on CPU needs minutes.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Environment overrides.
pub const ENV_OLLAMA_URL: &str = "MEDLENS_OLLAMA_URL";
pub const ENV_MODEL: &str = "MEDLENS_MODEL";
pub const ENV_DUMP_DIR: &str = "MEDLENS_DUMP_DIR";

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "medlens_lib=info"
}

/// Get the application data directory (`~/MedLens/`).
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_NAME))
}

/// Default location of the pipeline configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|dir| dir.join("config.json"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ═══════════════════════════════════════════════════════════
// Generation parameters
// ═══════════════════════════════════════════════════════════

/// Valid sampling temperature range.
const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;

/// Valid output length cap (tokens).
const MAX_OUTPUT_RANGE: std::ops::RangeInclusive<u32> = 1..=32_768;

/// Sampling parameters for one stage's generation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling randomness.
    pub temperature: f32,
    /// Token cap for the generated output.
    pub max_output_length: u32,
}

impl GenerationParams {
    /// Stage defaults. Visual analysis is descriptive and runs nearly
    /// deterministic; the patient report favors natural phrasing.
    pub fn default_for(stage: Stage) -> Self {
        match stage {
            Stage::VisualAnalysis => Self {
                temperature: 0.1,
                max_output_length: 1024,
            },
            Stage::ClinicalReasoning => Self {
                temperature: 0.3,
                max_output_length: 1536,
            },
            Stage::PatientReport => Self {
                temperature: 0.6,
                max_output_length: 1024,
            },
        }
    }

    /// Build params from a free-form options object.
    ///
    /// Only `temperature` and `max_output_length` are recognized. Anything
    /// else is ignored; missing or invalid values keep the stage default.
    pub fn from_options(stage: Stage, options: &serde_json::Value) -> Self {
        let mut params = Self::default_for(stage);

        if let Some(t) = options.get("temperature").and_then(|v| v.as_f64()) {
            let t = t as f32;
            if t.is_finite() && TEMPERATURE_RANGE.contains(&t) {
                params.temperature = t;
            } else {
                tracing::warn!(stage = %stage, value = t, "Ignoring out-of-range temperature");
            }
        }

        if let Some(n) = options.get("max_output_length").and_then(|v| v.as_u64()) {
            match u32::try_from(n) {
                Ok(n) if MAX_OUTPUT_RANGE.contains(&n) => params.max_output_length = n,
                _ => tracing::warn!(stage = %stage, value = n, "Ignoring out-of-range max_output_length"),
            }
        }

        params
    }
}

// ═══════════════════════════════════════════════════════════
// Pipeline configuration
// ═══════════════════════════════════════════════════════════

/// Per-stage option blocks as they appear in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    pub visual_analysis: serde_json::Value,
    pub clinical_reasoning: serde_json::Value,
    pub patient_report: serde_json::Value,
}

/// Pipeline configuration. Every key is optional in the JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ollama base URL.
    pub base_url: String,
    /// Model tag. `None` = resolve the best available MedGemma.
    pub model: Option<String>,
    /// HTTP timeout for one generation call.
    pub timeout_secs: u64,
    /// Where to write per-run diagnostic artifacts. `None` = disabled.
    pub dump_dir: Option<PathBuf>,
    /// Raw per-stage generation options.
    pub stages: StageOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            model: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            dump_dir: None,
            stages: StageOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Load `~/MedLens/config.json` if it exists, defaults otherwise.
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply `MEDLENS_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_OLLAMA_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.trim().is_empty()) {
            self.model = Some(model);
        }
        if let Some(dir) = lookup(ENV_DUMP_DIR).filter(|v| !v.trim().is_empty()) {
            self.dump_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Resolved generation params for a stage.
    pub fn params_for(&self, stage: Stage) -> GenerationParams {
        let options = match stage {
            Stage::VisualAnalysis => &self.stages.visual_analysis,
            Stage::ClinicalReasoning => &self.stages.clinical_reasoning,
            Stage::PatientReport => &self.stages.patient_report,
        };
        GenerationParams::from_options(stage, options)
    }
}
