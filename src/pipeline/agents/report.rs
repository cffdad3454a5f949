use std::sync::Arc;

use super::{push_line, push_list, AgentCore, StageAgent, StageError};
use crate::config::GenerationParams;
use crate::pipeline::generation::GenerationClient;
use crate::pipeline::parsing::{clean_model_output, extract_field, split_list_items};
use crate::pipeline::readability::flesch_kincaid_grade;
use crate::pipeline::types::{ClinicalAssessment, PatientReport, PatientReportDraft, Urgency};
use crate::pipeline::Stage;

pub const REPORT_SYSTEM_PROMPT: &str = "You are a patient communication assistant. \
Rewrite the clinical assessment below in plain language a patient can understand. \
Use short sentences and everyday words, aiming for a 6th to 8th grade reading level. \
Explain medical terms when you must use them. Do not give a diagnosis. Encourage the \
patient to discuss the findings with their doctor.";

const NO_ASSESSMENT: &str = "No clinical assessment available.";

const SUMMARY_HEADERS: &[&str] = &["SUMMARY", "OVERVIEW"];
const FINDINGS_HEADERS: &[&str] = &["FINDINGS IN PLAIN LANGUAGE", "WHAT WE FOUND", "FINDINGS"];
const MEANING_HEADERS: &[&str] = &["WHAT IT MIGHT MEAN", "WHAT THIS MEANS", "MEANING"];
const NEXT_STEPS_HEADERS: &[&str] = &["WHAT TO DO NEXT", "NEXT STEPS"];
const QUESTIONS_HEADERS: &[&str] = &[
    "QUESTIONS TO ASK YOUR DOCTOR",
    "QUESTIONS TO ASK",
    "QUESTIONS",
];

const RESPONSE_TEMPLATE: &str = "\
Respond using exactly these sections:

SUMMARY: <two or three sentences>
WHAT WE FOUND: <what the image and notes show, in plain words>
WHAT IT MIGHT MEAN: <possible explanations, in plain words>
NEXT STEPS:
- <one step per line>
QUESTIONS TO ASK YOUR DOCTOR:
- <one question per line>";

/// Turns a clinical assessment into a plain-language patient report.
pub struct PatientReportAgent {
    core: AgentCore,
}

impl PatientReportAgent {
    pub fn new(client: Arc<dyn GenerationClient>, model: &str) -> Self {
        Self {
            core: AgentCore::new(client, model, Stage::PatientReport),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.core.set_params(params);
        self
    }

    pub fn params(&self) -> GenerationParams {
        self.core.params()
    }

    pub fn format_assessment(assessment: &ClinicalAssessment) -> String {
        let soap = assessment.soap();
        let mut lines = Vec::new();
        push_line(&mut lines, "Subjective", &soap.subjective);
        push_line(&mut lines, "Objective", &soap.objective);
        push_line(&mut lines, "Assessment", &soap.assessment);
        push_line(&mut lines, "Plan", &soap.plan);
        push_list(
            &mut lines,
            "Differential diagnosis",
            assessment.differential_diagnosis(),
        );
        push_list(
            &mut lines,
            "Recommended workup",
            assessment.recommended_workup(),
        );

        if lines.is_empty() {
            return NO_ASSESSMENT.to_string();
        }
        if assessment.urgency() != Urgency::Unknown {
            lines.push(format!("Urgency: {}", assessment.urgency()));
        }
        lines.join("\n")
    }

    pub fn build_prompt(assessment: &ClinicalAssessment) -> String {
        format!(
            "CLINICAL ASSESSMENT:\n{}\n\n{}",
            Self::format_assessment(assessment),
            RESPONSE_TEMPLATE
        )
    }

    /// Parse model output into a report. Never fails.
    ///
    /// The grade level is computed here from the plain-language findings and
    /// meaning (or the summary when both are empty), never taken from the
    /// model. Output without any expected section becomes the summary.
    pub fn parse_output(raw: &str) -> PatientReport {
        let text = clean_model_output(raw);

        let summary = extract_field(&text, SUMMARY_HEADERS);
        let findings = extract_field(&text, FINDINGS_HEADERS);
        let meaning = extract_field(&text, MEANING_HEADERS);
        let next_steps = extract_field(&text, NEXT_STEPS_HEADERS);
        let questions = extract_field(&text, QUESTIONS_HEADERS);

        let structured = [&summary, &findings, &meaning, &next_steps, &questions]
            .iter()
            .any(|field| field.is_some());

        let mut draft = if structured {
            PatientReportDraft {
                summary: summary.unwrap_or_default(),
                findings_plain_language: findings.unwrap_or_default(),
                what_it_might_mean: meaning.unwrap_or_default(),
                next_steps: next_steps
                    .as_deref()
                    .map(split_list_items)
                    .unwrap_or_default(),
                questions_to_ask: questions
                    .as_deref()
                    .map(split_list_items)
                    .unwrap_or_default(),
                ..Default::default()
            }
        } else {
            if !text.is_empty() {
                tracing::warn!(
                    stage = %Stage::PatientReport,
                    "No structured sections in model output, using raw summary"
                );
            }
            PatientReportDraft {
                summary: text.clone(),
                ..Default::default()
            }
        };

        draft.reading_grade_level = flesch_kincaid_grade(&graded_text(&draft));
        draft.raw_text = raw.to_string();
        draft.build()
    }
}

/// Text the reading level is measured over.
fn graded_text(draft: &PatientReportDraft) -> String {
    let parts: Vec<&str> = [
        draft.findings_plain_language.trim(),
        draft.what_it_might_mean.trim(),
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .collect();

    if parts.is_empty() {
        draft.summary.clone()
    } else {
        parts.join(" ")
    }
}

impl StageAgent for PatientReportAgent {
    type Input<'a> = &'a ClinicalAssessment;
    type Output = PatientReport;

    fn stage(&self) -> Stage {
        Stage::PatientReport
    }

    fn run(&self, assessment: Self::Input<'_>) -> Result<PatientReport, StageError> {
        let _span = tracing::info_span!("patient_report", model = %self.core.model()).entered();

        let prompt = Self::build_prompt(assessment);
        let raw = self
            .core
            .generate(Stage::PatientReport, REPORT_SYSTEM_PROMPT, &prompt, None)?;

        let report = Self::parse_output(&raw);
        if !report.is_reading_level_on_target() {
            tracing::warn!(
                grade = report.reading_grade_level(),
                "Patient report reading level outside target range"
            );
        }
        tracing::info!(
            grade = report.reading_grade_level(),
            next_steps = report.next_steps().len(),
            questions = report.questions_to_ask().len(),
            "Patient report complete"
        );
        Ok(report)
    }
}
