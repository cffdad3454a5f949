//! Per-run diagnostic dump of stage artifacts.
//!
//! Disabled unless a dump directory is configured (`dump_dir` in the config
//! file or `MEDLENS_DUMP_DIR`). Layout:
//!
//! ```text
//! {dump_dir}/{run_id}/
//!   01-visual-findings.json
//!   01-visual-findings.raw.txt
//!   02-clinical-assessment.json
//!   02-clinical-assessment.raw.txt
//!   03-patient-report.json
//!   03-patient-report.raw.txt
//!   failure.json
//! ```
//!
//! Every writer logs and swallows its own errors. A dump never affects the
//! outcome of a run.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::Stage;

pub const FAILURE_FILE: &str = "failure.json";

/// JSON artifact name for a stage's record.
pub fn record_file(stage: Stage) -> &'static str {
    match stage {
        Stage::VisualAnalysis => "01-visual-findings.json",
        Stage::ClinicalReasoning => "02-clinical-assessment.json",
        Stage::PatientReport => "03-patient-report.json",
    }
}

/// Raw model output artifact name for a stage.
pub fn raw_output_file(stage: Stage) -> &'static str {
    match stage {
        Stage::VisualAnalysis => "01-visual-findings.raw.txt",
        Stage::ClinicalReasoning => "02-clinical-assessment.raw.txt",
        Stage::PatientReport => "03-patient-report.raw.txt",
    }
}

/// Create `{base}/{run_id}` and return it, or `None` if creation fails.
pub fn dump_dir_for(base: &Path, run_id: &Uuid) -> Option<PathBuf> {
    let dir = base.join(run_id.to_string());

    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(
            path = %dir.display(),
            error = %e,
            "Diagnostic dump: failed to create directory"
        );
        return None;
    }

    Some(dir)
}

/// Pretty-printed JSON artifact.
pub fn dump_json<T: serde::Serialize>(dir: &Path, filename: &str, value: &T) {
    let path = dir.join(filename);
    let json = match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Diagnostic dump: failed to serialize JSON"
            );
            return;
        }
    };
    write_artifact(&path, json.as_bytes());
}

/// Plain text artifact (raw model output).
pub fn dump_text(dir: &Path, filename: &str, text: &str) {
    write_artifact(&dir.join(filename), text.as_bytes());
}

fn write_artifact(path: &Path, data: &[u8]) {
    match std::fs::write(path, data) {
        Ok(()) => tracing::debug!(
            path = %path.display(),
            size = data.len(),
            "Diagnostic dump: artifact written"
        ),
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Diagnostic dump: failed to write artifact"
        ),
    }
}

/// Record and raw output of one completed stage.
pub fn dump_stage<T: serde::Serialize>(dir: &Path, stage: Stage, record: &T, raw_text: &str) {
    dump_json(dir, record_file(stage), record);
    dump_text(dir, raw_output_file(stage), raw_text);
}
