use std::sync::Arc;

use super::{push_line, push_list, AgentCore, StageAgent, StageError};
use crate::config::GenerationParams;
use crate::pipeline::generation::GenerationClient;
use crate::pipeline::parsing::{
    clean_model_output, extract_field, parse_confidence, parse_urgency, split_list_items,
};
use crate::pipeline::types::{
    ClinicalAssessment, ClinicalAssessmentDraft, PatientContext, Severity, SoapNote, Urgency,
    VisualFindings,
};
use crate::pipeline::Stage;

pub const REASONING_SYSTEM_PROMPT: &str = "You are a clinical reasoning assistant. \
Given visual findings from a clinical image analysis and patient context, provide a \
structured clinical assessment: a SOAP note, a differential diagnosis ranked by \
likelihood, recommended workup and an urgency assessment (routine, urgent or emergent). \
This is for clinical decision support only and is not a definitive diagnosis.";

const NO_FINDINGS: &str = "No visual findings available.";
const NO_CONTEXT: &str = "No patient context provided.";

const SUBJECTIVE_HEADERS: &[&str] = &["SUBJECTIVE"];
const OBJECTIVE_HEADERS: &[&str] = &["OBJECTIVE"];
const ASSESSMENT_HEADERS: &[&str] = &["CLINICAL ASSESSMENT", "ASSESSMENT"];
const PLAN_HEADERS: &[&str] = &["MANAGEMENT PLAN", "PLAN"];
const DIFFERENTIAL_HEADERS: &[&str] = &[
    "DIFFERENTIAL DIAGNOSES",
    "DIFFERENTIAL DIAGNOSIS",
    "DIFFERENTIALS",
    "DIFFERENTIAL",
];
const WORKUP_HEADERS: &[&str] = &[
    "RECOMMENDED WORK-UP",
    "RECOMMENDED WORKUP",
    "WORK-UP",
    "WORKUP",
];
const URGENCY_HEADERS: &[&str] = &["URGENCY ASSESSMENT", "URGENCY", "TRIAGE"];

const RESPONSE_TEMPLATE: &str = "\
Respond using exactly these sections:

SUBJECTIVE: <history as reported by the patient>
OBJECTIVE: <examination and image findings>
ASSESSMENT: <clinical interpretation>
PLAN: <management plan>
DIFFERENTIAL DIAGNOSIS:
- <most likely diagnosis>
- <next most likely diagnosis>
RECOMMENDED WORKUP:
- <test or referral>
URGENCY: <routine, urgent or emergent>
CONFIDENCE: <high, moderate or low>";

/// Stage 2 input.
#[derive(Debug, Clone, Copy)]
pub struct ReasoningInput<'a> {
    pub findings: &'a VisualFindings,
    pub context: &'a PatientContext,
}

/// Combines visual findings with patient context into a clinical assessment.
pub struct ClinicalReasoningAgent {
    core: AgentCore,
}

impl ClinicalReasoningAgent {
    pub fn new(client: Arc<dyn GenerationClient>, model: &str) -> Self {
        Self {
            core: AgentCore::new(client, model, Stage::ClinicalReasoning),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.core.set_params(params);
        self
    }

    pub fn params(&self) -> GenerationParams {
        self.core.params()
    }

    pub fn format_findings(findings: &VisualFindings) -> String {
        let mut lines = Vec::new();
        push_line(&mut lines, "Description", findings.description());
        push_line(&mut lines, "Morphology", findings.morphology());
        push_line(&mut lines, "Anatomical location", findings.location());
        if findings.severity() != Severity::Unknown {
            push_line(&mut lines, "Severity", findings.severity().as_str());
        }
        push_list(&mut lines, "Colors", findings.color_descriptors());
        push_line(&mut lines, "Size", findings.size_estimate().unwrap_or_default());
        push_line(
            &mut lines,
            "Borders",
            findings.border_characteristics().unwrap_or_default(),
        );
        push_list(
            &mut lines,
            "Additional observations",
            findings.additional_observations(),
        );

        if lines.is_empty() {
            return NO_FINDINGS.to_string();
        }
        lines.push(format!("Visual confidence: {:.2}", findings.confidence()));
        lines.join("\n")
    }

    pub fn format_context(context: &PatientContext) -> String {
        let mut lines = Vec::new();
        if let Some(age) = context.age {
            lines.push(format!("Age: {age}"));
        }
        push_line(&mut lines, "Sex", &context.sex);
        push_line(&mut lines, "Chief complaint", &context.chief_complaint);
        push_line(
            &mut lines,
            "History of present illness",
            &context.history_of_present_illness,
        );
        push_line(&mut lines, "Past medical history", &context.past_medical_history);
        push_line(&mut lines, "Medications", &context.medications);
        push_line(&mut lines, "Allergies", &context.allergies);
        push_line(&mut lines, "Additional notes", &context.additional_notes);

        if lines.is_empty() {
            NO_CONTEXT.to_string()
        } else {
            lines.join("\n")
        }
    }

    pub fn build_prompt(findings: &VisualFindings, context: &PatientContext) -> String {
        format!(
            "VISUAL FINDINGS:\n{}\n\nPATIENT CONTEXT:\n{}\n\n{}",
            Self::format_findings(findings),
            Self::format_context(context),
            RESPONSE_TEMPLATE
        )
    }

    /// Parse model output into an assessment. Never fails.
    ///
    /// Urgency is read from the urgency section only; when it is missing the
    /// urgency is unknown. Output without any expected section becomes the
    /// SOAP assessment.
    pub fn parse_output(raw: &str) -> ClinicalAssessment {
        let text = clean_model_output(raw);

        let subjective = extract_field(&text, SUBJECTIVE_HEADERS);
        let objective = extract_field(&text, OBJECTIVE_HEADERS);
        let assessment = extract_field(&text, ASSESSMENT_HEADERS);
        let plan = extract_field(&text, PLAN_HEADERS);
        let differential = extract_field(&text, DIFFERENTIAL_HEADERS);
        let workup = extract_field(&text, WORKUP_HEADERS);
        let urgency = extract_field(&text, URGENCY_HEADERS);

        let structured = [
            &subjective,
            &objective,
            &assessment,
            &plan,
            &differential,
            &workup,
            &urgency,
        ]
        .iter()
        .any(|field| field.is_some());

        if !structured {
            if !text.is_empty() {
                tracing::warn!(
                    stage = %Stage::ClinicalReasoning,
                    "No structured sections in model output, using raw assessment"
                );
            }
            return ClinicalAssessmentDraft {
                soap: SoapNote {
                    assessment: text.clone(),
                    ..Default::default()
                },
                urgency: Urgency::Unknown,
                confidence: parse_confidence(&text),
                raw_text: raw.to_string(),
                ..Default::default()
            }
            .build();
        }

        ClinicalAssessmentDraft {
            soap: SoapNote {
                subjective: subjective.unwrap_or_default(),
                objective: objective.unwrap_or_default(),
                assessment: assessment.unwrap_or_default(),
                plan: plan.unwrap_or_default(),
            },
            differential_diagnosis: differential
                .as_deref()
                .map(split_list_items)
                .unwrap_or_default(),
            recommended_workup: workup.as_deref().map(split_list_items).unwrap_or_default(),
            urgency: urgency.as_deref().map(parse_urgency).unwrap_or_default(),
            confidence: parse_confidence(&text),
            raw_text: raw.to_string(),
        }
        .build()
    }
}

impl StageAgent for ClinicalReasoningAgent {
    type Input<'a> = ReasoningInput<'a>;
    type Output = ClinicalAssessment;

    fn stage(&self) -> Stage {
        Stage::ClinicalReasoning
    }

    fn run(&self, input: Self::Input<'_>) -> Result<ClinicalAssessment, StageError> {
        let _span =
            tracing::info_span!("clinical_reasoning", model = %self.core.model()).entered();

        input
            .context
            .validate()
            .map_err(|source| StageError::Validation {
                stage: Stage::ClinicalReasoning,
                source,
            })?;

        let prompt = Self::build_prompt(input.findings, input.context);
        let raw = self.core.generate(
            Stage::ClinicalReasoning,
            REASONING_SYSTEM_PROMPT,
            &prompt,
            None,
        )?;

        let assessment = Self::parse_output(&raw);
        tracing::info!(
            urgency = %assessment.urgency(),
            differentials = assessment.differential_diagnosis().len(),
            confidence = assessment.confidence(),
            "Clinical reasoning complete"
        );
        Ok(assessment)
    }
}
