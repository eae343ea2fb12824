//! Domain error taxonomy.
//!
//! Per-file failures are folded into job outcomes by the job runner; the
//! variants that escape to the CLI map onto distinct exit codes so batch
//! schedulers can tell retrieval problems from incomplete batches.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// An expected file or resource is absent.
    #[error("{what} not found: {}", path.display())]
    NotFound { what: String, path: PathBuf },

    /// Content digest did not match the expected value.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Remote fetch exhausted its retry budget.
    #[error("retrieval of {} failed after {attempts} attempts: {last_error}", remote.display())]
    RetrievalFailed {
        remote: PathBuf,
        attempts: u32,
        last_error: String,
    },

    /// An external stage or structural check rejected its input.
    #[error("{stage} failed: {detail}")]
    Validation { stage: String, detail: String },

    /// More than one calibration file matches a run.
    #[error("multiple calibration files for run {run}: {}", format_paths(candidates))]
    AmbiguousResolution { run: u64, candidates: Vec<PathBuf> },

    /// Input and output accounting disagree.
    #[error("accounting mismatch: {problems} problem(s) found")]
    ReconciliationMismatch { problems: usize },

    /// Dispatched jobs finished without a recorded completion.
    #[error("batch incomplete, did not finish: {}", missing.join(", "))]
    BatchIncomplete { missing: Vec<String> },
}

impl PipelineError {
    pub fn not_found(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        PipelineError::NotFound {
            what: what.into(),
            path: path.into(),
        }
    }

    pub fn validation(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        PipelineError::Validation {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Process exit code for this failure family.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::ReconciliationMismatch { .. } => 1,
            PipelineError::NotFound { .. } => 2,
            PipelineError::Integrity { .. } => 3,
            PipelineError::RetrievalFailed { .. } => 4,
            PipelineError::Validation { .. } => 5,
            PipelineError::AmbiguousResolution { .. } => 6,
            PipelineError::BatchIncomplete { .. } => 7,
        }
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Exit code for an arbitrary error chain, defaulting to 1 when no domain
/// error is present.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::exit_code)
        .unwrap_or(1)
}
