//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and a non-zero exit code for batch schedulers.

use carbonmatch::PipelineError;
use std::fmt;
use std::process;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Bad command-line usage that clap cannot catch
    Usage(String),
    /// A pipeline stage failed
    Stage { stage: &'static str, error: PipelineError },
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::Stage {
            error: PipelineError::MissingArtifact(_),
            stage,
        } = self
        {
            eprintln!();
            match *stage {
                "match" => eprintln!("Run 'carbonmatch extract' first to produce the pixel tables."),
                "summarize" => eprintln!("Run 'carbonmatch match' first to produce match files."),
                _ => {}
            }
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Usage(msg) => write!(f, "{}", msg),
            CliError::Stage { stage, error } => write!(f, "{} stage failed: {}", stage, error),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Stage { error, .. } => Some(error),
            _ => None,
        }
    }
}
