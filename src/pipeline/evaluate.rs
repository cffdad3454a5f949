//! Batch evaluation: run the pipeline over labelled cases and summarize
//! latency, readability and output shape.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::orchestrator::{MedLensOrchestrator, PipelineFailure, PipelineResult, StageTiming};
use super::types::{ClinicalImage, PatientContext, Urgency};
use super::Stage;

/// Latency budget used for the "under 30 s" share.
pub const LATENCY_TARGET: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One input case.
#[derive(Debug, Clone)]
pub struct EvaluationCase {
    pub label: String,
    pub image: ClinicalImage,
    pub patient_context: PatientContext,
}

impl EvaluationCase {
    /// Load the image from disk; the file path becomes the label.
    pub fn from_path(path: &Path, patient_context: PatientContext) -> std::io::Result<Self> {
        Ok(Self {
            label: path.display().to_string(),
            image: ClinicalImage::from_path(path)?,
            patient_context,
        })
    }
}

/// Metrics from one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub label: String,
    pub total_secs: f64,
    pub visual_analysis_secs: f64,
    pub clinical_reasoning_secs: f64,
    pub patient_report_secs: f64,
    pub reading_grade_level: Option<f64>,
    pub grade_target_met: bool,
    pub differential_count: usize,
    pub urgency: Option<Urgency>,
    pub visual_confidence: Option<f32>,
    pub clinical_confidence: Option<f32>,
    pub success: bool,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
}

impl EvaluationResult {
    fn blank(label: &str, timings: &[StageTiming]) -> Self {
        let secs = |stage: Stage| {
            timings
                .iter()
                .find(|t| t.stage == stage)
                .map(|t| t.elapsed.as_secs_f64())
                .unwrap_or(0.0)
        };
        Self {
            label: label.to_string(),
            total_secs: timings.iter().map(|t| t.elapsed).sum::<Duration>().as_secs_f64(),
            visual_analysis_secs: secs(Stage::VisualAnalysis),
            clinical_reasoning_secs: secs(Stage::ClinicalReasoning),
            patient_report_secs: secs(Stage::PatientReport),
            reading_grade_level: None,
            grade_target_met: false,
            differential_count: 0,
            urgency: None,
            visual_confidence: None,
            clinical_confidence: None,
            success: false,
            failed_stage: None,
            error: None,
        }
    }

    pub fn from_success(label: &str, result: &PipelineResult) -> Self {
        let report = &result.patient_report;
        let assessment = &result.clinical_assessment;
        Self {
            reading_grade_level: Some(report.reading_grade_level()),
            grade_target_met: report.is_reading_level_on_target(),
            differential_count: assessment.differential_diagnosis().len(),
            urgency: Some(assessment.urgency()),
            visual_confidence: Some(result.visual_findings.confidence()),
            clinical_confidence: Some(assessment.confidence()),
            success: true,
            ..Self::blank(label, &result.timings)
        }
    }

    pub fn from_failure(label: &str, failure: &PipelineFailure) -> Self {
        let findings = failure.partial.visual_findings.as_ref();
        let assessment = failure.partial.clinical_assessment.as_ref();
        Self {
            differential_count: assessment.map_or(0, |a| a.differential_diagnosis().len()),
            urgency: assessment.map(|a| a.urgency()),
            visual_confidence: findings.map(|f| f.confidence()),
            clinical_confidence: assessment.map(|a| a.confidence()),
            failed_stage: Some(failure.stage),
            error: Some(failure.to_string()),
            ..Self::blank(label, &failure.timings)
        }
    }
}

/// Run one case and collect its metrics. Failures become failed results.
pub fn evaluate_single(
    orchestrator: &MedLensOrchestrator,
    case: &EvaluationCase,
) -> EvaluationResult {
    match orchestrator.run(&case.image, &case.patient_context, None) {
        Ok(result) => EvaluationResult::from_success(&case.label, &result),
        Err(failure) => EvaluationResult::from_failure(&case.label, &failure),
    }
}

/// Run every case in order; optionally write the results as a JSON array.
pub fn evaluate_batch(
    orchestrator: &MedLensOrchestrator,
    cases: &[EvaluationCase],
    output_path: Option<&Path>,
) -> Result<Vec<EvaluationResult>, EvaluationError> {
    let mut results = Vec::with_capacity(cases.len());
    for (i, case) in cases.iter().enumerate() {
        tracing::info!(
            case = i + 1,
            total = cases.len(),
            label = %case.label,
            "Evaluating case"
        );
        results.push(evaluate_single(orchestrator, case));
    }

    if let Some(path) = output_path {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&results)?)?;
        tracing::info!(path = %path.display(), "Evaluation results written");
    }

    Ok(results)
}

// ═══════════════════════════════════════════════════════════
// Summary
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean_secs: f64,
    /// Upper median for even counts.
    pub median_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    /// Share of successful runs at or under [`LATENCY_TARGET`].
    pub under_target_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total_cases: usize,
    pub successful_cases: usize,
    pub success_rate: f64,
    /// `None` when no case succeeded.
    pub latency: Option<LatencySummary>,
    /// Mean over positive grades of successful runs.
    pub grade_mean: f64,
    pub grade_target_rate: f64,
    pub avg_differentials: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Aggregate metrics over successful runs. `None` for an empty slice.
pub fn summarize_results(results: &[EvaluationResult]) -> Option<EvaluationSummary> {
    if results.is_empty() {
        return None;
    }

    let successful: Vec<&EvaluationResult> = results.iter().filter(|r| r.success).collect();
    let n_success = successful.len();

    let mut times: Vec<f64> = successful.iter().map(|r| r.total_secs).collect();
    times.sort_by(|a, b| a.total_cmp(b));

    let latency = (!times.is_empty()).then(|| {
        let target = LATENCY_TARGET.as_secs_f64();
        LatencySummary {
            mean_secs: mean(&times),
            median_secs: times[times.len() / 2],
            min_secs: times[0],
            max_secs: times[times.len() - 1],
            under_target_rate: times.iter().filter(|t| **t <= target).count() as f64
                / times.len() as f64,
        }
    });

    let grades: Vec<f64> = successful
        .iter()
        .filter_map(|r| r.reading_grade_level)
        .filter(|g| *g > 0.0)
        .collect();
    let on_target = successful.iter().filter(|r| r.grade_target_met).count();
    let differentials: Vec<f64> = successful
        .iter()
        .map(|r| r.differential_count as f64)
        .collect();

    let rate = |count: usize| {
        if n_success == 0 {
            0.0
        } else {
            count as f64 / n_success as f64
        }
    };

    Some(EvaluationSummary {
        total_cases: results.len(),
        successful_cases: n_success,
        success_rate: n_success as f64 / results.len() as f64,
        latency,
        grade_mean: mean(&grades),
        grade_target_rate: rate(on_target),
        avg_differentials: mean(&differentials),
    })
}
