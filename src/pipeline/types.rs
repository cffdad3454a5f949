use std::fmt;
use std::path::Path;

use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize};

use super::agents::ValidationError;
use super::parsing::DEFAULT_CONFIDENCE;

/// Fixed boilerplate attached to every patient report.
pub const PATIENT_DISCLAIMER: &str = "This report was generated by an AI system to help you \
prepare for a conversation with your doctor. It is NOT a medical diagnosis and must not \
replace a consultation with a qualified health professional. If your symptoms get worse \
or you feel unwell, seek medical care right away.";

/// Oldest plausible patient age (years).
const MAX_PLAUSIBLE_AGE: u32 = 130;

/// Reading grade window the patient report aims for.
pub const TARGET_GRADE_RANGE: std::ops::RangeInclusive<f64> = 6.0..=8.0;

// ═══════════════════════════════════════════════════════════
// Vocabulary enums
// ═══════════════════════════════════════════════════════════

/// Visual severity of a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
    #[default]
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mild => "mild",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triage urgency of a clinical assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Routine,
    Urgent,
    Emergent,
    #[default]
    Unknown,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routine => "routine",
            Self::Urgent => "urgent",
            Self::Emergent => "emergent",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// Inputs
// ═══════════════════════════════════════════════════════════

/// Encoded clinical photograph handed to the visual stage.
#[derive(Clone, PartialEq, Eq)]
pub struct ClinicalImage {
    bytes: Vec<u8>,
}

impl ClinicalImage {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_bytes(std::fs::read(path)?))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check the image is non-empty and sniffs as PNG, JPEG or WebP.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bytes.is_empty() {
            return Err(ValidationError::EmptyImage);
        }
        match image::guess_format(&self.bytes) {
            Ok(image::ImageFormat::Png | image::ImageFormat::Jpeg | image::ImageFormat::WebP) => {
                Ok(())
            }
            Ok(other) => Err(ValidationError::UnsupportedImageFormat(format!("{other:?}"))),
            Err(_) => Err(ValidationError::UnsupportedImageFormat("unrecognized".into())),
        }
    }

    /// Base64 payload for the Ollama `images` field.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

impl fmt::Debug for ClinicalImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClinicalImage")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Patient demographic and clinical context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientContext {
    pub age: Option<u32>,
    pub sex: String,
    pub chief_complaint: String,
    pub history_of_present_illness: String,
    pub past_medical_history: String,
    pub medications: String,
    pub allergies: String,
    pub additional_notes: String,
}

impl PatientContext {
    /// Every field is optional; an age, when given, must be plausible.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(age) = self.age {
            if age > MAX_PLAUSIBLE_AGE {
                return Err(ValidationError::ImplausibleAge(age));
            }
        }
        Ok(())
    }

    /// Short free-text context for the visual stage.
    pub fn image_context(&self) -> String {
        [self.chief_complaint.trim(), self.additional_notes.trim()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ═══════════════════════════════════════════════════════════
// Stage records
// ═══════════════════════════════════════════════════════════

/// Clamp to [0, 1]; non-finite values take the fallback.
pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        DEFAULT_CONFIDENCE
    }
}

fn de_confidence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    let raw = Option::<f32>::deserialize(deserializer)?;
    Ok(raw.map(clamp_confidence).unwrap_or(DEFAULT_CONFIDENCE))
}

fn de_disclaimer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| PATIENT_DISCLAIMER.to_string()))
}

fn default_confidence() -> f32 {
    DEFAULT_CONFIDENCE
}

fn default_disclaimer() -> String {
    PATIENT_DISCLAIMER.to_string()
}

fn to_key_values<T: Serialize>(value: &T) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// Stage 1 output: what the image shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualFindings {
    description: String,
    morphology: String,
    location: String,
    severity: Severity,
    color_descriptors: Vec<String>,
    size_estimate: Option<String>,
    border_characteristics: Option<String>,
    additional_observations: Vec<String>,
    #[serde(deserialize_with = "de_confidence", default = "default_confidence")]
    confidence: f32,
    raw_text: String,
}

/// Mutable builder for [`VisualFindings`].
#[derive(Debug, Clone, Default)]
pub struct VisualFindingsDraft {
    pub description: String,
    pub morphology: String,
    pub location: String,
    pub severity: Severity,
    pub color_descriptors: Vec<String>,
    pub size_estimate: Option<String>,
    pub border_characteristics: Option<String>,
    pub additional_observations: Vec<String>,
    pub confidence: f32,
    pub raw_text: String,
}

impl VisualFindingsDraft {
    pub fn build(self) -> VisualFindings {
        VisualFindings {
            description: self.description,
            morphology: self.morphology,
            location: self.location,
            severity: self.severity,
            color_descriptors: self.color_descriptors,
            size_estimate: self.size_estimate.filter(|s| !s.trim().is_empty()),
            border_characteristics: self.border_characteristics.filter(|s| !s.trim().is_empty()),
            additional_observations: self.additional_observations,
            confidence: clamp_confidence(self.confidence),
            raw_text: self.raw_text,
        }
    }
}

impl VisualFindings {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn morphology(&self) -> &str {
        &self.morphology
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn color_descriptors(&self) -> &[String] {
        &self.color_descriptors
    }

    pub fn size_estimate(&self) -> Option<&str> {
        self.size_estimate.as_deref()
    }

    pub fn border_characteristics(&self) -> Option<&str> {
        self.border_characteristics.as_deref()
    }

    pub fn additional_observations(&self) -> &[String] {
        &self.additional_observations
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// True when no descriptive field was recovered.
    pub fn is_empty(&self) -> bool {
        self.description.is_empty()
            && self.morphology.is_empty()
            && self.location.is_empty()
            && self.color_descriptors.is_empty()
            && self.size_estimate.is_none()
            && self.border_characteristics.is_none()
            && self.additional_observations.is_empty()
    }

    pub fn to_key_values(&self) -> serde_json::Map<String, serde_json::Value> {
        to_key_values(self)
    }
}

/// The four SOAP sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoapNote {
    pub subjective: String,
    pub objective: String,
    pub assessment: String,
    pub plan: String,
}

impl SoapNote {
    pub fn is_empty(&self) -> bool {
        self.subjective.is_empty()
            && self.objective.is_empty()
            && self.assessment.is_empty()
            && self.plan.is_empty()
    }

    /// Standard SOAP layout.
    pub fn format(&self) -> String {
        format!(
            "SUBJECTIVE:\n{}\n\nOBJECTIVE:\n{}\n\nASSESSMENT:\n{}\n\nPLAN:\n{}",
            self.subjective, self.objective, self.assessment, self.plan
        )
    }
}

/// Stage 2 output: clinical reasoning over the findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalAssessment {
    soap: SoapNote,
    soap_note: String,
    #[serde(default)]
    differential_diagnosis: Vec<String>,
    #[serde(default)]
    recommended_workup: Vec<String>,
    urgency: Urgency,
    #[serde(deserialize_with = "de_confidence", default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    raw_text: String,
}

/// Mutable builder for [`ClinicalAssessment`].
#[derive(Debug, Clone, Default)]
pub struct ClinicalAssessmentDraft {
    pub soap: SoapNote,
    pub differential_diagnosis: Vec<String>,
    pub recommended_workup: Vec<String>,
    pub urgency: Urgency,
    pub confidence: f32,
    pub raw_text: String,
}

impl ClinicalAssessmentDraft {
    pub fn build(self) -> ClinicalAssessment {
        let soap_note = self.soap.format();
        ClinicalAssessment {
            soap: self.soap,
            soap_note,
            differential_diagnosis: self.differential_diagnosis,
            recommended_workup: self.recommended_workup,
            urgency: self.urgency,
            confidence: clamp_confidence(self.confidence),
            raw_text: self.raw_text,
        }
    }
}

impl ClinicalAssessment {
    pub fn soap(&self) -> &SoapNote {
        &self.soap
    }

    pub fn soap_note(&self) -> &str {
        &self.soap_note
    }

    /// Ranked, most likely first.
    pub fn differential_diagnosis(&self) -> &[String] {
        &self.differential_diagnosis
    }

    pub fn recommended_workup(&self) -> &[String] {
        &self.recommended_workup
    }

    pub fn urgency(&self) -> Urgency {
        self.urgency
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn is_empty(&self) -> bool {
        self.soap.is_empty()
            && self.differential_diagnosis.is_empty()
            && self.recommended_workup.is_empty()
    }

    pub fn to_key_values(&self) -> serde_json::Map<String, serde_json::Value> {
        to_key_values(self)
    }
}

/// Stage 3 output: plain-language report for the patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientReport {
    summary: String,
    findings_plain_language: String,
    what_it_might_mean: String,
    #[serde(default)]
    next_steps: Vec<String>,
    #[serde(default)]
    questions_to_ask: Vec<String>,
    reading_grade_level: f64,
    #[serde(deserialize_with = "de_disclaimer", default = "default_disclaimer")]
    disclaimer: String,
    #[serde(default)]
    raw_text: String,
}

/// Mutable builder for [`PatientReport`]. The disclaimer is not settable.
#[derive(Debug, Clone, Default)]
pub struct PatientReportDraft {
    pub summary: String,
    pub findings_plain_language: String,
    pub what_it_might_mean: String,
    pub next_steps: Vec<String>,
    pub questions_to_ask: Vec<String>,
    pub reading_grade_level: f64,
    pub raw_text: String,
}

impl PatientReportDraft {
    pub fn build(self) -> PatientReport {
        PatientReport {
            summary: self.summary,
            findings_plain_language: self.findings_plain_language,
            what_it_might_mean: self.what_it_might_mean,
            next_steps: self.next_steps,
            questions_to_ask: self.questions_to_ask,
            reading_grade_level: self.reading_grade_level,
            disclaimer: PATIENT_DISCLAIMER.to_string(),
            raw_text: self.raw_text,
        }
    }
}

impl PatientReport {
    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn findings_plain_language(&self) -> &str {
        &self.findings_plain_language
    }

    pub fn what_it_might_mean(&self) -> &str {
        &self.what_it_might_mean
    }

    pub fn next_steps(&self) -> &[String] {
        &self.next_steps
    }

    pub fn questions_to_ask(&self) -> &[String] {
        &self.questions_to_ask
    }

    pub fn reading_grade_level(&self) -> f64 {
        self.reading_grade_level
    }

    pub fn disclaimer(&self) -> &str {
        &self.disclaimer
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// Quality signal only: callers flag reports outside grades 6-8.
    pub fn is_reading_level_on_target(&self) -> bool {
        TARGET_GRADE_RANGE.contains(&self.reading_grade_level)
    }

    pub fn to_key_values(&self) -> serde_json::Map<String, serde_json::Value> {
        to_key_values(self)
    }
}
