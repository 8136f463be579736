//! Run result types.
//!
//! Contains the outcome of one pipeline run over the tree.

use crate::build::TransformFailure;
use std::path::PathBuf;
use std::time::Duration;

/// Result of a complete pipeline run.
#[derive(Debug, Default, Clone)]
pub struct RunResult {
    /// Number of `transform` calls made
    pub transformed: usize,
    /// Source entries whose transform chain was restored from the cache
    pub cached: usize,
    /// Untransformed sources copied to the output tree
    pub copied: usize,
    /// Output files written (relative to the output root)
    pub written: Vec<PathBuf>,
    /// Stale output files deleted (relative to the output root)
    pub deleted: Vec<PathBuf>,
    /// Recovered `test`/`transform` failures
    pub failures: Vec<TransformFailure>,
    /// Total run duration
    pub duration: Duration,
}

impl RunResult {
    /// Create a new empty run result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Whether every transform succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether the run changed anything in the output tree.
    pub fn has_changes(&self) -> bool {
        !self.written.is_empty() || !self.deleted.is_empty()
    }

    /// Format a summary of the run.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Run complete: {} transformed, {} cached, {} copied, {} written, {} deleted in {:?}",
            self.transformed,
            self.cached,
            self.copied,
            self.written.len(),
            self.deleted.len(),
            self.duration
        )];

        if !self.failures.is_empty() {
            lines.push(format!("Transform failures ({}): ", self.failures.len()));
            for failure in self.failures.iter().take(5) {
                lines.push(format!("  - {}", failure));
            }
            if self.failures.len() > 5 {
                lines.push(format!("  ... and {} more", self.failures.len() - 5));
            }
        }

        lines.join("\n")
    }
}
