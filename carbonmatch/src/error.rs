//! Error types for the analysis pipeline.
//!
//! Errors are categorized by failure class rather than by stage: every
//! variant here is fatal for the invocation that raised it. Recoverable
//! per-site and per-stratum shortfalls (zero treatment pixels, no viable
//! strata, a solver that finds no pairs) are not errors - they are logged
//! and the affected site simply produces no output.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised by the extraction, matching, and summarization
/// engines.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid configuration or input file
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A required layer or column is absent, or layers disagree on shape
    #[error("schema error: {0}")]
    Schema(String),

    /// Upstream produced nothing for this stage to work on
    #[error("insufficient data: {0}")]
    DataSufficiency(String),

    /// Raster layer could not be opened or decoded
    #[error("raster error in '{layer}': {message}")]
    Raster { layer: String, message: String },

    /// HTTP range request failed
    #[error("HTTP error for {url}: {message}")]
    Http { url: String, message: String },

    /// An expected artifact file is missing
    #[error("missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read or write failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Convenience constructor for raster failures tied to a named layer.
    pub fn raster(layer: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Raster {
            layer: layer.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_error_names_the_layer() {
        let err = PipelineError::raster("region", "truncated IFD");
        assert_eq!(err.to_string(), "raster error in 'region': truncated IFD");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }
}
