use std::io;
use std::path::PathBuf;

/// Represents the different types of errors that can occur while training,
/// evaluating or tuning the classifier.
///
/// Per-row problems (`MalformedRecord`) are normally counted and skipped by the
/// loaders; the remaining variants are structural and abort the operation.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// A required file or artifact is absent
    #[error("Input missing: {}", .0.display())]
    InputMissing(PathBuf),
    /// A record failed to decode or carried no usable text
    #[error("Malformed record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },
    /// Zero usable rows after filtering
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),
    /// Label ordering or length disagrees with the artifact's label space
    #[error("Label space mismatch: expected {expected} labels, got {actual}")]
    LabelSpaceMismatch { expected: usize, actual: usize },
    /// Invalid input parameters
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Inconsistent model parameters or forward inputs
    #[error("Model error: {0}")]
    ModelError(String),
    /// Error occurred during the build phase
    #[error("Build error: {0}")]
    BuildError(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClassifierError {
    /// True for errors that concern a single record and may be skipped.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedRecord { .. })
    }
}
