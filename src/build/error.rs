//! Errors surfaced by a pipeline run.

use crate::pipe::PipeError;
use std::path::PathBuf;

/// Fatal error for one run. Transform failures are not errors; they are
/// collected in the run result instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// Invalid or contradictory pipeline setup, raised before any entry is processed
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A pipe's start step failed
    #[error("Pipe '{pipe}' failed to start: {source}")]
    Start {
        pipe: String,
        #[source]
        source: PipeError,
    },
    /// A pipe's finish step failed
    #[error("Pipe '{pipe}' failed to finish at '{}': {source}", path.display())]
    Finish {
        pipe: String,
        path: PathBuf,
        #[source]
        source: PipeError,
    },
    /// Reading or writing the source, output or cache tree failed
    #[error("Filesystem error at '{}': {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Filesystem { path: path.into(), source }
    }
}

/// A recovered `test`/`transform` failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformFailure {
    pub pipe: String,
    pub path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for TransformFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.pipe, self.path.display(), self.message)
    }
}
