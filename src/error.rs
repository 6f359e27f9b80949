// error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Every failure the pipeline can surface. Nothing is retried; the first error
/// aborts the stage that raised it.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("No '#' header line found in {}", .0.display())]
    MissingHeader(PathBuf),

    #[error("Malformed record at line {line} of {}: {message}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Genotype '{value}' at variant {variant}, sample {sample} is outside the known genotype set")]
    UnencodedGenotype {
        value: String,
        variant: String,
        sample: String,
    },

    #[error("Parameter '{name}' = {value} is out of range: expected {expected}")]
    ParameterOutOfRange {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("Unsupported imputation strategy '{0}' (expected 'mean', 'median' or 'most_frequent')")]
    UnsupportedStrategy(String),

    #[error("Unsupported value '{value}' for {what}")]
    UnsupportedKeyword { what: &'static str, value: String },

    #[error("Required artifact {} is missing: {hint}", path.display())]
    MissingArtifact { path: PathBuf, hint: String },

    #[error("Column '{column}' not found in {}", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Statistical test failed for '{variant}': {message}")]
    Statistics { variant: String, message: String },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
