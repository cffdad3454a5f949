//! Three-stage clinical image pipeline.
//!
//! ```text
//! (image, patient context)
//!   → VisualAnalysisAgent    → VisualFindings
//!   → ClinicalReasoningAgent → ClinicalAssessment
//!   → PatientReportAgent     → PatientReport
//! ```
//!
//! Stages run strictly in sequence against one shared generation client.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod types;
pub mod parsing;
pub mod readability;
pub mod generation;
pub mod agents;
pub mod orchestrator;
pub mod diagnostic;
pub mod evaluate;

pub use types::*;
pub use generation::{GenerationClient, GenerationError, GenerationRequest};
pub use agents::{
    ClinicalReasoningAgent, PatientReportAgent, StageAgent, StageError, ValidationError,
    VisualAnalysisAgent,
};
pub use orchestrator::{
    FailureKind, MedLensOrchestrator, PartialResults, PipelineFailure, PipelineResult,
    ProgressEvent, StageStatus, StageTiming,
};

/// One of the three sequential processing steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    VisualAnalysis,
    ClinicalReasoning,
    PatientReport,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 3] = [
        Stage::VisualAnalysis,
        Stage::ClinicalReasoning,
        Stage::PatientReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VisualAnalysis => "visual_analysis",
            Self::ClinicalReasoning => "clinical_reasoning",
            Self::PatientReport => "patient_report",
        }
    }

    /// 1-based position in the pipeline.
    pub fn number(&self) -> u8 {
        match self {
            Self::VisualAnalysis => 1,
            Self::ClinicalReasoning => 2,
            Self::PatientReport => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
