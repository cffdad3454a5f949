//! Drives the three agents in order:
//! visual analysis → clinical reasoning → patient report
//!
//! Each stage's record feeds the next. The orchestrator times every stage,
//! reports progress through an optional callback, and on failure returns the
//! records completed so far. It holds no lock: callers must not start
//! overlapping runs against one model instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::agents::{
    ClinicalReasoningAgent, PatientReportAgent, ReasoningInput, StageAgent, StageError,
    VisualAnalysisAgent, VisualInput,
};
use super::diagnostic;
use super::generation::{resolve_model, GenerationClient, GenerationError};
use super::types::{ClinicalAssessment, ClinicalImage, PatientContext, PatientReport, VisualFindings};
use super::Stage;
use crate::config::PipelineConfig;

// ═══════════════════════════════════════════════════════════
// Progress and results
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Completed,
    Failed,
}

/// One progress notification.
///
/// `elapsed` is the pipeline time accumulated so far: the sum of completed
/// stage durations, plus the current stage's duration once it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub status: StageStatus,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed: Duration,
}

/// Outcome of a successful run: all three records plus latencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub visual_findings: VisualFindings,
    pub clinical_assessment: ClinicalAssessment,
    pub patient_report: PatientReport,
    /// One entry per stage, in execution order.
    pub timings: Vec<StageTiming>,
    /// Sum of the stage timings.
    pub total_elapsed: Duration,
}

impl PipelineResult {
    pub fn stage_elapsed(&self, stage: Stage) -> Option<Duration> {
        stage_elapsed(&self.timings, stage)
    }

    pub fn soap_note(&self) -> &str {
        self.clinical_assessment.soap_note()
    }
}

/// Records completed before a failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialResults {
    pub visual_findings: Option<VisualFindings>,
    pub clinical_assessment: Option<ClinicalAssessment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Generation,
}

/// A run that stopped early.
#[derive(Debug, Error, Serialize)]
#[error("MedLens pipeline failed at {stage}: {reason}")]
pub struct PipelineFailure {
    pub run_id: Uuid,
    pub stage: Stage,
    pub kind: FailureKind,
    pub reason: String,
    pub partial: PartialResults,
    /// Timings of the stages that completed.
    pub timings: Vec<StageTiming>,
    #[source]
    #[serde(skip)]
    pub source: StageError,
}

impl PipelineFailure {
    fn new(
        run_id: Uuid,
        source: StageError,
        partial: PartialResults,
        timings: Vec<StageTiming>,
    ) -> Self {
        let (kind, reason) = match &source {
            StageError::Validation { source, .. } => (FailureKind::Validation, source.to_string()),
            StageError::Generation { source, .. } => (FailureKind::Generation, source.to_string()),
        };
        Self {
            run_id,
            stage: source.stage(),
            kind,
            reason,
            partial,
            timings,
            source,
        }
    }
}

fn stage_elapsed(timings: &[StageTiming], stage: Stage) -> Option<Duration> {
    timings.iter().find(|t| t.stage == stage).map(|t| t.elapsed)
}

fn total_elapsed(timings: &[StageTiming]) -> Duration {
    timings.iter().map(|t| t.elapsed).sum()
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

pub type ProgressCallback<'a> = &'a dyn Fn(&ProgressEvent);

pub struct MedLensOrchestrator {
    visual: VisualAnalysisAgent,
    reasoning: ClinicalReasoningAgent,
    report: PatientReportAgent,
    dump_dir: Option<PathBuf>,
}

impl MedLensOrchestrator {
    /// All three agents share `client`. Stage defaults apply.
    pub fn new(client: Arc<dyn GenerationClient>, model: &str) -> Self {
        Self {
            visual: VisualAnalysisAgent::new(client.clone(), model),
            reasoning: ClinicalReasoningAgent::new(client.clone(), model),
            report: PatientReportAgent::new(client, model),
            dump_dir: None,
        }
    }

    /// Stage params and dump directory taken from `config`.
    pub fn from_config(
        client: Arc<dyn GenerationClient>,
        model: &str,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            visual: VisualAnalysisAgent::new(client.clone(), model)
                .with_params(config.params_for(Stage::VisualAnalysis)),
            reasoning: ClinicalReasoningAgent::new(client.clone(), model)
                .with_params(config.params_for(Stage::ClinicalReasoning)),
            report: PatientReportAgent::new(client, model)
                .with_params(config.params_for(Stage::PatientReport)),
            dump_dir: config.dump_dir.clone(),
        }
    }

    /// Like [`Self::from_config`], with the model resolved against the
    /// backend: `config.model` when installed, else the best MedGemma tag.
    pub fn resolve(
        client: Arc<dyn GenerationClient>,
        config: &PipelineConfig,
    ) -> Result<Self, GenerationError> {
        let model = resolve_model(client.as_ref(), config.model.as_deref())?;
        tracing::info!(model = %model, "Model resolved");
        Ok(Self::from_config(client, &model, config))
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    pub fn dump_dir(&self) -> Option<&Path> {
        self.dump_dir.as_deref()
    }

    pub fn visual_agent(&self) -> &VisualAnalysisAgent {
        &self.visual
    }

    pub fn reasoning_agent(&self) -> &ClinicalReasoningAgent {
        &self.reasoning
    }

    pub fn report_agent(&self) -> &PatientReportAgent {
        &self.report
    }

    /// Run the full pipeline.
    ///
    /// The patient context is validated before stage 1; a rejected context
    /// fails at the clinical reasoning stage without any progress events or
    /// generation calls. The callback runs synchronously on this thread.
    pub fn run(
        &self,
        image: &ClinicalImage,
        context: &PatientContext,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<PipelineResult, PipelineFailure> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let _span = tracing::info_span!("pipeline_run", run_id = %run_id).entered();

        let dump = self
            .dump_dir
            .as_deref()
            .and_then(|base| diagnostic::dump_dir_for(base, &run_id));

        let mut run = RunState {
            run_id,
            on_progress,
            timings: Vec::with_capacity(Stage::ALL.len()),
            partial: PartialResults::default(),
            dump,
        };

        if let Err(source) = context.validate() {
            return Err(run.fail(StageError::Validation {
                stage: Stage::ClinicalReasoning,
                source,
            }));
        }

        let clinical_context = context.image_context();
        let findings = run.stage(Stage::VisualAnalysis, || {
            self.visual.run(VisualInput {
                image,
                clinical_context: &clinical_context,
            })
        })?;
        run.dump_stage(Stage::VisualAnalysis, &findings, findings.raw_text());
        run.partial.visual_findings = Some(findings.clone());

        let assessment = run.stage(Stage::ClinicalReasoning, || {
            self.reasoning.run(ReasoningInput {
                findings: &findings,
                context,
            })
        })?;
        run.dump_stage(Stage::ClinicalReasoning, &assessment, assessment.raw_text());
        run.partial.clinical_assessment = Some(assessment.clone());

        let report = run.stage(Stage::PatientReport, || self.report.run(&assessment))?;
        run.dump_stage(Stage::PatientReport, &report, report.raw_text());

        let total = total_elapsed(&run.timings);
        tracing::info!(
            total_ms = total.as_millis() as u64,
            urgency = %assessment.urgency(),
            grade = report.reading_grade_level(),
            "MedLens pipeline complete"
        );

        Ok(PipelineResult {
            run_id,
            started_at,
            visual_findings: findings,
            clinical_assessment: assessment,
            patient_report: report,
            timings: run.timings,
            total_elapsed: total,
        })
    }
}

/// Bookkeeping for a single run.
struct RunState<'a> {
    run_id: Uuid,
    on_progress: Option<ProgressCallback<'a>>,
    timings: Vec<StageTiming>,
    partial: PartialResults,
    dump: Option<PathBuf>,
}

impl RunState<'_> {
    fn notify(&self, stage: Stage, status: StageStatus, elapsed: Duration) {
        if let Some(callback) = self.on_progress {
            callback(&ProgressEvent {
                stage,
                status,
                elapsed,
            });
        }
    }

    /// Time one stage, emitting its start and end events.
    fn stage<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce() -> Result<T, StageError>,
    ) -> Result<T, PipelineFailure> {
        let before = total_elapsed(&self.timings);
        self.notify(stage, StageStatus::Started, before);

        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        match result {
            Ok(record) => {
                self.timings.push(StageTiming { stage, elapsed });
                tracing::info!(
                    stage = %stage,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Stage complete"
                );
                self.notify(stage, StageStatus::Completed, before + elapsed);
                Ok(record)
            }
            Err(e) => {
                self.notify(stage, StageStatus::Failed, before + elapsed);
                Err(self.fail(e))
            }
        }
    }

    fn fail(&mut self, source: StageError) -> PipelineFailure {
        tracing::warn!(
            stage = %source.stage(),
            error = %source,
            "MedLens pipeline aborted"
        );
        let failure = PipelineFailure::new(
            self.run_id,
            source,
            std::mem::take(&mut self.partial),
            std::mem::take(&mut self.timings),
        );
        if let Some(dir) = &self.dump {
            diagnostic::dump_json(dir, diagnostic::FAILURE_FILE, &failure);
        }
        failure
    }

    fn dump_stage<T: Serialize>(&self, stage: Stage, record: &T, raw_text: &str) {
        if let Some(dir) = &self.dump {
            diagnostic::dump_stage(dir, stage, record, raw_text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::pipeline::generation::{GenerationError, MockGenerationClient};
    use crate::pipeline::{Severity, Urgency, ValidationError};

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    const VISUAL_OUTPUT: &str = "DESCRIPTION: Dark irregular papule\nSEVERITY: severe\n\
COLOR DESCRIPTORS: dark brown, black\nCONFIDENCE: 0.9";
    const REASONING_OUTPUT: &str = "SUBJECTIVE: Growing mole.\nOBJECTIVE: Dark papule.\n\
ASSESSMENT: Concerning for melanoma.\nPLAN: Urgent dermatology referral.\n\
DIFFERENTIAL DIAGNOSIS: melanoma, dysplastic nevus\nRECOMMENDED WORKUP: excisional biopsy\n\
URGENCY: urgent\nCONFIDENCE: 80%";
    const REPORT_OUTPUT: &str = "SUMMARY: You have a dark spot that needs a check.\n\
WHAT WE FOUND: A dark spot with uneven edges.\nWHAT IT MIGHT MEAN: It could be a skin problem.\n\
NEXT STEPS:\n- See a skin doctor this week.\nQUESTIONS TO ASK YOUR DOCTOR:\n- Do I need a biopsy?";

    fn scripted_client() -> MockGenerationClient {
        MockGenerationClient::scripted(vec![
            VISUAL_OUTPUT.into(),
            REASONING_OUTPUT.into(),
            REPORT_OUTPUT.into(),
        ])
    }

    fn image() -> ClinicalImage {
        ClinicalImage::from_bytes(PNG_MAGIC.to_vec())
    }

    fn context() -> PatientContext {
        PatientContext {
            age: Some(45),
            sex: "male".into(),
            chief_complaint: "growing mole".into(),
            ..Default::default()
        }
    }

    #[test]
    fn full_run_produces_all_records() {
        let mock = Arc::new(scripted_client());
        let orchestrator = MedLensOrchestrator::new(mock.clone(), "medgemma");

        let result = orchestrator.run(&image(), &context(), None).unwrap();
        assert_eq!(result.visual_findings.severity(), Severity::Severe);
        assert_eq!(result.visual_findings.confidence(), 0.9);
        assert_eq!(result.clinical_assessment.urgency(), Urgency::Urgent);
        assert_eq!(result.patient_report.questions_to_ask(), &["Do I need a biopsy?"]);
        assert!(result.soap_note().contains("Concerning for melanoma"));
        assert_eq!(mock.call_count(), 3);
    }

    #[test]
    fn stages_thread_outputs_forward() {
        let mock = Arc::new(scripted_client());
        let orchestrator = MedLensOrchestrator::new(mock.clone(), "medgemma");
        orchestrator.run(&image(), &context(), None).unwrap();

        let requests = mock.requests();
        assert!(requests[0].has_image);
        assert!(requests[0].prompt.contains("Clinical context: growing mole"));
        assert!(requests[1].prompt.contains("Dark irregular papule"));
        assert!(requests[1].prompt.contains("Age: 45"));
        assert!(requests[2].prompt.contains("Concerning for melanoma"));
        assert!(!requests[1].has_image && !requests[2].has_image);
    }

    #[test]
    fn total_is_sum_of_stage_timings() {
        let orchestrator = MedLensOrchestrator::new(Arc::new(scripted_client()), "medgemma");
        let result = orchestrator.run(&image(), &context(), None).unwrap();

        let stages: Vec<Stage> = result.timings.iter().map(|t| t.stage).collect();
        assert_eq!(stages, Stage::ALL.to_vec());
        let sum: Duration = result.timings.iter().map(|t| t.elapsed).sum();
        assert_eq!(result.total_elapsed, sum);
        assert!(result.stage_elapsed(Stage::PatientReport).is_some());
    }

    #[test]
    fn progress_events_are_ordered() {
        let orchestrator = MedLensOrchestrator::new(Arc::new(scripted_client()), "medgemma");
        let events = RefCell::new(Vec::new());
        let record = |e: &ProgressEvent| events.borrow_mut().push(*e);

        let result = orchestrator.run(&image(), &context(), Some(&record)).unwrap();
        let events = events.into_inner();

        let sequence: Vec<(Stage, StageStatus)> =
            events.iter().map(|e| (e.stage, e.status)).collect();
        assert_eq!(
            sequence,
            vec![
                (Stage::VisualAnalysis, StageStatus::Started),
                (Stage::VisualAnalysis, StageStatus::Completed),
                (Stage::ClinicalReasoning, StageStatus::Started),
                (Stage::ClinicalReasoning, StageStatus::Completed),
                (Stage::PatientReport, StageStatus::Started),
                (Stage::PatientReport, StageStatus::Completed),
            ]
        );
        assert!(events.windows(2).all(|w| w[0].elapsed <= w[1].elapsed));
        assert_eq!(events[5].elapsed, result.total_elapsed);
    }

    #[test]
    fn stage_two_failure_keeps_stage_one_and_skips_stage_three() {
        let mock = Arc::new(scripted_client().failing_on(1, "CUDA out of memory"));
        let orchestrator = MedLensOrchestrator::new(mock.clone(), "medgemma");
        let events = RefCell::new(Vec::new());
        let record = |e: &ProgressEvent| events.borrow_mut().push(*e);

        let failure = orchestrator
            .run(&image(), &context(), Some(&record))
            .unwrap_err();

        assert_eq!(failure.stage, Stage::ClinicalReasoning);
        assert_eq!(failure.kind, FailureKind::Generation);
        assert!(failure.reason.contains("CUDA out of memory"));
        assert!(matches!(
            failure.source,
            StageError::Generation {
                source: GenerationError::Execution(_),
                ..
            }
        ));
        assert!(failure.partial.visual_findings.is_some());
        assert!(failure.partial.clinical_assessment.is_none());
        assert_eq!(failure.timings.len(), 1);
        assert_eq!(mock.call_count(), 2);

        let events = events.into_inner();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].status, StageStatus::Failed);
        assert!(events.iter().all(|e| e.stage != Stage::PatientReport));
    }

    #[test]
    fn invalid_context_fails_before_any_stage() {
        let mock = Arc::new(scripted_client());
        let orchestrator = MedLensOrchestrator::new(mock.clone(), "medgemma");
        let events = RefCell::new(Vec::new());
        let record = |e: &ProgressEvent| events.borrow_mut().push(*e);

        let context = PatientContext {
            age: Some(200),
            ..context()
        };
        let failure = orchestrator
            .run(&image(), &context, Some(&record))
            .unwrap_err();

        assert_eq!(failure.stage, Stage::ClinicalReasoning);
        assert_eq!(failure.kind, FailureKind::Validation);
        assert!(matches!(
            failure.source,
            StageError::Validation {
                source: ValidationError::ImplausibleAge(200),
                ..
            }
        ));
        assert!(failure.partial.visual_findings.is_none());
        assert!(events.into_inner().is_empty());
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn invalid_image_fails_at_visual_stage() {
        let mock = Arc::new(scripted_client());
        let orchestrator = MedLensOrchestrator::new(mock.clone(), "medgemma");
        let failure = orchestrator
            .run(&ClinicalImage::from_bytes(b"GIF89a".to_vec()), &context(), None)
            .unwrap_err();
        assert_eq!(failure.stage, Stage::VisualAnalysis);
        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn failure_display_names_stage() {
        let mock = Arc::new(scripted_client().failing_on(2, "timeout"));
        let orchestrator = MedLensOrchestrator::new(mock, "medgemma");
        let failure = orchestrator.run(&image(), &context(), None).unwrap_err();
        assert_eq!(failure.stage, Stage::PatientReport);
        assert!(failure.partial.clinical_assessment.is_some());
        assert_eq!(
            failure.to_string(),
            "MedLens pipeline failed at patient_report: Generation failed: timeout"
        );
    }

    #[test]
    fn from_config_applies_stage_params_and_dump_dir() {
        let config = PipelineConfig::from_json(
            r#"{"dump_dir": "/tmp/medlens", "stages": {"clinical_reasoning": {"temperature": 0.5}}}"#,
        )
        .unwrap();
        let orchestrator =
            MedLensOrchestrator::from_config(Arc::new(scripted_client()), "medgemma", &config);
        assert!((orchestrator.reasoning_agent().params().temperature - 0.5).abs() < f32::EPSILON);
        assert_eq!(
            orchestrator.visual_agent().params(),
            config.params_for(Stage::VisualAnalysis)
        );
        assert_eq!(orchestrator.dump_dir(), Some(Path::new("/tmp/medlens")));
    }

    #[test]
    fn resolve_uses_configured_model_when_installed() {
        let config = PipelineConfig::from_json(r#"{"model": "medgemma:27b"}"#).unwrap();
        let mock = Arc::new(
            scripted_client().with_models(vec!["medgemma:4b".into(), "medgemma:27b-it".into()]),
        );
        let orchestrator = MedLensOrchestrator::resolve(mock.clone(), &config).unwrap();
        orchestrator.run(&image(), &context(), None).unwrap();
        assert!(mock.requests().iter().all(|r| r.model == "medgemma:27b-it"));
    }

    #[test]
    fn resolve_without_medgemma_is_an_error() {
        let mock = Arc::new(scripted_client().with_models(vec!["llama3:8b".into()]));
        assert!(matches!(
            MedLensOrchestrator::resolve(mock, &PipelineConfig::default()),
            Err(GenerationError::NoModelAvailable)
        ));
    }

    #[test]
    fn dump_dir_receives_stage_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = MedLensOrchestrator::new(Arc::new(scripted_client()), "medgemma")
            .with_dump_dir(tmp.path());

        let result = orchestrator.run(&image(), &context(), None).unwrap();
        let run_dir = tmp.path().join(result.run_id.to_string());
        for stage in Stage::ALL {
            assert!(run_dir.join(diagnostic::record_file(stage)).exists());
            assert!(run_dir.join(diagnostic::raw_output_file(stage)).exists());
        }
        assert!(!run_dir.join(diagnostic::FAILURE_FILE).exists());
    }

    #[test]
    fn dump_dir_receives_failure_record() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = MedLensOrchestrator::new(
            Arc::new(scripted_client().failing_on(1, "model load failed")),
            "medgemma",
        )
        .with_dump_dir(tmp.path());

        let failure = orchestrator.run(&image(), &context(), None).unwrap_err();
        let run_dir = tmp.path().join(failure.run_id.to_string());
        let json = std::fs::read_to_string(run_dir.join(diagnostic::FAILURE_FILE)).unwrap();
        assert!(json.contains("\"stage\": \"clinical_reasoning\""));
        assert!(json.contains("\"kind\": \"generation\""));
        assert!(run_dir.join("01-visual-findings.json").exists());
    }
}
