use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::OptionLabel;

/// Failures the pipeline distinguishes between when deciding to abort,
/// degrade, or fall back.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("generation server unreachable at {host}:{port} ({reason})")]
    UnreachableServer {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("workflow template missing: {}", .0.display())]
    MissingTemplate(PathBuf),
    #[error("job {prompt_id} not finished after {attempts} polls ({:.1}s)", .elapsed.as_secs_f64())]
    JobTimeout {
        prompt_id: String,
        attempts: u32,
        elapsed: Duration,
    },
    #[error("job {prompt_id} failed: {message}")]
    JobFailed { prompt_id: String, message: String },
    #[error("artifact retrieval failed for {}", describe_failed(.failed))]
    ArtifactRetrieval { failed: Vec<(OptionLabel, String)> },
    #[error("scene object '{0}' no longer resolves")]
    InvalidatedReference(String),
    #[error("mesh file is empty: {}", .0.display())]
    EmptyMesh(PathBuf),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Preflight failures abort an operation before anything is written.
    pub fn is_preflight(&self) -> bool {
        matches!(self, Self::UnreachableServer { .. } | Self::MissingTemplate(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::JobTimeout { .. })
    }

    /// Labels that failed during a partial artifact retrieval.
    pub fn failed_labels(&self) -> Vec<OptionLabel> {
        match self {
            Self::ArtifactRetrieval { failed } => failed.iter().map(|(label, _)| *label).collect(),
            _ => Vec::new(),
        }
    }
}

fn describe_failed(failed: &[(OptionLabel, String)]) -> String {
    failed
        .iter()
        .map(|(label, reason)| format!("{label}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}
