use std::sync::Arc;

use super::{AgentCore, StageAgent, StageError};
use crate::config::GenerationParams;
use crate::pipeline::generation::GenerationClient;
use crate::pipeline::parsing::{
    clean_model_output, extract_field, parse_confidence, parse_severity, split_list_items,
};
use crate::pipeline::types::{ClinicalImage, Severity, VisualFindings, VisualFindingsDraft};
use crate::pipeline::Stage;

pub const VISUAL_SYSTEM_PROMPT: &str = "You are a medical image analysis assistant. \
Analyze the provided clinical image and describe your findings in a structured format. \
Be thorough but factual. Do not diagnose. Only describe what you observe.";

const DESCRIPTION_HEADERS: &[&str] = &["OVERALL DESCRIPTION", "DESCRIPTION", "OVERVIEW"];
const MORPHOLOGY_HEADERS: &[&str] = &["MORPHOLOGICAL FEATURES", "MORPHOLOGY"];
const LOCATION_HEADERS: &[&str] = &["ANATOMICAL LOCATION", "BODY SITE", "LOCATION", "SITE"];
const SEVERITY_HEADERS: &[&str] = &["SEVERITY ASSESSMENT", "SEVERITY"];
const COLOR_HEADERS: &[&str] = &["COLOUR DESCRIPTORS", "COLOR DESCRIPTORS", "COLOURS", "COLORS", "COLOR"];
const SIZE_HEADERS: &[&str] = &["SIZE ESTIMATE", "SIZE"];
const BORDER_HEADERS: &[&str] = &["BORDER CHARACTERISTICS", "BORDERS", "BORDER"];
const OBSERVATION_HEADERS: &[&str] = &[
    "ADDITIONAL OBSERVATIONS",
    "OTHER OBSERVATIONS",
    "OBSERVATIONS",
];

const RESPONSE_TEMPLATE: &str = "\
Respond using exactly these sections, one per line:

DESCRIPTION: <overall description of the finding>
MORPHOLOGY: <morphological features, comma-separated>
ANATOMICAL LOCATION: <body site>
SEVERITY: <mild, moderate or severe>
COLOR DESCRIPTORS: <colors, comma-separated>
SIZE ESTIMATE: <approximate size>
BORDER CHARACTERISTICS: <border description>
ADDITIONAL OBSERVATIONS: <other observations, comma-separated>
CONFIDENCE: <high, moderate or low>";

/// Stage 1 input.
#[derive(Debug, Clone, Copy)]
pub struct VisualInput<'a> {
    pub image: &'a ClinicalImage,
    /// Brief free-text context, e.g. "left forearm lesion". May be blank.
    pub clinical_context: &'a str,
}

/// Describes a clinical photograph through the multimodal model.
pub struct VisualAnalysisAgent {
    core: AgentCore,
}

impl VisualAnalysisAgent {
    pub fn new(client: Arc<dyn GenerationClient>, model: &str) -> Self {
        Self {
            core: AgentCore::new(client, model, Stage::VisualAnalysis),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.core.set_params(params);
        self
    }

    pub fn params(&self) -> GenerationParams {
        self.core.params()
    }

    pub fn build_prompt(clinical_context: &str) -> String {
        let mut prompt = String::from("Analyze this clinical image.\n\n");
        let context = clinical_context.trim();
        if !context.is_empty() {
            prompt.push_str(&format!("Clinical context: {context}\n\n"));
        }
        prompt.push_str(RESPONSE_TEMPLATE);
        prompt
    }

    /// Parse model output into findings. Never fails.
    ///
    /// When none of the expected sections is present the cleaned output
    /// becomes the description.
    pub fn parse_output(raw: &str) -> VisualFindings {
        let text = clean_model_output(raw);

        let description = extract_field(&text, DESCRIPTION_HEADERS);
        let morphology = extract_field(&text, MORPHOLOGY_HEADERS);
        let location = extract_field(&text, LOCATION_HEADERS);
        let severity = extract_field(&text, SEVERITY_HEADERS);
        let colors = extract_field(&text, COLOR_HEADERS);
        let size = extract_field(&text, SIZE_HEADERS);
        let border = extract_field(&text, BORDER_HEADERS);
        let observations = extract_field(&text, OBSERVATION_HEADERS);

        let structured = [
            &description,
            &morphology,
            &location,
            &severity,
            &colors,
            &size,
            &border,
            &observations,
        ]
        .iter()
        .any(|field| field.is_some());

        if !structured {
            if !text.is_empty() {
                tracing::warn!(
                    stage = %Stage::VisualAnalysis,
                    "No structured sections in model output, using raw description"
                );
            }
            return VisualFindingsDraft {
                description: text.clone(),
                severity: Severity::Unknown,
                confidence: parse_confidence(&text),
                raw_text: raw.to_string(),
                ..Default::default()
            }
            .build();
        }

        VisualFindingsDraft {
            description: description.unwrap_or_default(),
            morphology: morphology.unwrap_or_default(),
            location: location.unwrap_or_default(),
            severity: severity.as_deref().map(parse_severity).unwrap_or_default(),
            color_descriptors: colors.as_deref().map(split_list_items).unwrap_or_default(),
            size_estimate: size,
            border_characteristics: border,
            additional_observations: observations
                .as_deref()
                .map(split_list_items)
                .unwrap_or_default(),
            confidence: parse_confidence(&text),
            raw_text: raw.to_string(),
        }
        .build()
    }
}

impl StageAgent for VisualAnalysisAgent {
    type Input<'a> = VisualInput<'a>;
    type Output = VisualFindings;

    fn stage(&self) -> Stage {
        Stage::VisualAnalysis
    }

    fn run(&self, input: Self::Input<'_>) -> Result<VisualFindings, StageError> {
        let _span = tracing::info_span!("visual_analysis", model = %self.core.model()).entered();

        input.image.validate().map_err(|source| StageError::Validation {
            stage: Stage::VisualAnalysis,
            source,
        })?;

        let prompt = Self::build_prompt(input.clinical_context);
        let raw = self.core.generate(
            Stage::VisualAnalysis,
            VISUAL_SYSTEM_PROMPT,
            &prompt,
            Some(input.image),
        )?;

        let findings = Self::parse_output(&raw);
        tracing::info!(
            severity = %findings.severity(),
            confidence = findings.confidence(),
            colors = findings.color_descriptors().len(),
            "Visual analysis complete"
        );
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::generation::{GenerationError, MockGenerationClient};
    use crate::pipeline::parsing::DEFAULT_CONFIDENCE;
    use crate::pipeline::ValidationError;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    const SAMPLE_OUTPUT: &str = "DESCRIPTION: Erythematous papule with irregular borders on the dorsal \
surface of the left forearm. The lesion appears raised with surrounding mild erythema.
MORPHOLOGY: papule, raised, irregular shape, dome-shaped
ANATOMICAL LOCATION: left forearm, dorsal surface
SEVERITY: moderate
COLOR DESCRIPTORS: erythematous, pink, brown center
SIZE ESTIMATE: approximately 5mm in diameter
BORDER CHARACTERISTICS: irregular, poorly defined margins with asymmetric outline
ADDITIONAL OBSERVATIONS: no ulceration, no satellite lesions, mild surrounding erythema
CONFIDENCE: high";

    #[test]
    fn parse_structured_output() {
        let findings = VisualAnalysisAgent::parse_output(SAMPLE_OUTPUT);
        assert!(findings.description().starts_with("Erythematous papule"));
        assert_eq!(findings.morphology(), "papule, raised, irregular shape, dome-shaped");
        assert_eq!(findings.location(), "left forearm, dorsal surface");
        assert_eq!(findings.severity(), Severity::Moderate);
        assert_eq!(
            findings.color_descriptors(),
            &["erythematous", "pink", "brown center"]
        );
        assert_eq!(findings.size_estimate(), Some("approximately 5mm in diameter"));
        assert!(findings.border_characteristics().unwrap().starts_with("irregular"));
        assert_eq!(findings.additional_observations().len(), 3);
        assert_eq!(findings.confidence(), 0.9);
        assert_eq!(findings.raw_text(), SAMPLE_OUTPUT);
    }

    #[test]
    fn parse_empty_output() {
        let findings = VisualAnalysisAgent::parse_output("");
        assert!(findings.is_empty());
        assert_eq!(findings.severity(), Severity::Unknown);
        assert_eq!(findings.confidence(), DEFAULT_CONFIDENCE);
    }

    #[test]
    fn unstructured_output_becomes_description() {
        let raw = "This is an unstructured description without any headers.";
        let findings = VisualAnalysisAgent::parse_output(raw);
        assert_eq!(findings.description(), raw);
        assert_eq!(findings.raw_text(), raw);
        assert_eq!(findings.severity(), Severity::Unknown);
        assert_eq!(findings.confidence(), DEFAULT_CONFIDENCE);
    }

    #[test]
    fn thinking_preamble_is_stripped_but_raw_kept() {
        let raw = "<unused94>thought\nSEVERITY: mild\nLOCATION: scalp<unused95>";
        let findings = VisualAnalysisAgent::parse_output(raw);
        assert_eq!(findings.severity(), Severity::Mild);
        assert_eq!(findings.location(), "scalp");
        assert_eq!(findings.raw_text(), raw);
    }

    #[test]
    fn headers_inside_thinking_do_not_shadow_the_answer() {
        let raw = "<unused94>thought\nSEVERITY: maybe mild? Let me look closer.\n\
<unused95>SEVERITY: severe\nANATOMICAL LOCATION: scalp";
        let findings = VisualAnalysisAgent::parse_output(raw);
        assert_eq!(findings.severity(), Severity::Severe);
        assert_eq!(findings.location(), "scalp");
        assert_eq!(findings.raw_text(), raw);
    }

    #[test]
    fn synonym_headers_are_recognized() {
        let raw = "## Body Site: upper back\n**Borders:** well defined\nSize: 1 cm";
        let findings = VisualAnalysisAgent::parse_output(raw);
        assert_eq!(findings.location(), "upper back");
        assert_eq!(findings.border_characteristics(), Some("well defined"));
        assert_eq!(findings.size_estimate(), Some("1 cm"));
    }

    #[test]
    fn prompt_without_context() {
        let prompt = VisualAnalysisAgent::build_prompt("");
        assert!(!prompt.contains("Clinical context"));
        assert!(prompt.contains("DESCRIPTION:"));
        assert!(prompt.contains("CONFIDENCE:"));
    }

    #[test]
    fn prompt_with_context() {
        let prompt = VisualAnalysisAgent::build_prompt("left forearm lesion");
        assert!(prompt.contains("Clinical context: left forearm lesion"));
    }

    #[test]
    fn run_sends_image_with_low_temperature() {
        let mock = Arc::new(MockGenerationClient::new(SAMPLE_OUTPUT));
        let agent = VisualAnalysisAgent::new(mock.clone(), "medgemma");
        let image = ClinicalImage::from_bytes(PNG_MAGIC.to_vec());

        let findings = agent
            .run(VisualInput {
                image: &image,
                clinical_context: "left forearm lesion",
            })
            .unwrap();
        assert_eq!(findings.severity(), Severity::Moderate);

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].has_image);
        assert_eq!(requests[0].system, VISUAL_SYSTEM_PROMPT);
        assert!(requests[0].params.temperature <= 0.2);
    }

    #[test]
    fn invalid_image_never_reaches_the_model() {
        let mock = Arc::new(MockGenerationClient::new(SAMPLE_OUTPUT));
        let agent = VisualAnalysisAgent::new(mock.clone(), "medgemma");
        let image = ClinicalImage::from_bytes(Vec::new());

        let err = agent
            .run(VisualInput {
                image: &image,
                clinical_context: "",
            })
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Validation {
                stage: Stage::VisualAnalysis,
                source: ValidationError::EmptyImage
            }
        ));
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn generation_failure_propagates() {
        let mock = Arc::new(MockGenerationClient::new("").failing_on(0, "model load failed"));
        let agent = VisualAnalysisAgent::new(mock, "medgemma");
        let image = ClinicalImage::from_bytes(PNG_MAGIC.to_vec());

        let err = agent
            .run(VisualInput {
                image: &image,
                clinical_context: "",
            })
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Generation {
                stage: Stage::VisualAnalysis,
                source: GenerationError::Execution(_)
            }
        ));
    }

    #[test]
    fn custom_params_are_used() {
        let params = GenerationParams {
            temperature: 0.0,
            max_output_length: 256,
        };
        let agent = VisualAnalysisAgent::new(Arc::new(MockGenerationClient::new("x")), "m")
            .with_params(params);
        assert_eq!(agent.params(), params);
        assert_eq!(agent.stage(), Stage::VisualAnalysis);
    }
}
