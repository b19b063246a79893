//! Error reporting context threaded through each pipeline stage.
//!
//! The original system reported failures through a process-wide reporting
//! client toggled by environment variables. Here the reporter is an
//! explicitly passed trait object so tests can inject a no-op and the CLI
//! can forward failures to external tracking before exiting non-zero.

use crate::config::AnalysisConfig;
use crate::error::PipelineError;
use tracing::error;

/// Receives fatal pipeline errors before the invocation aborts.
pub trait ErrorReporter: Send + Sync {
    /// Report a fatal error for the named stage ("extract", "match",
    /// "summarize"). Called at most once per invocation, best-effort:
    /// reporting failures must not mask the original error.
    fn report(&self, stage: &str, error: &PipelineError);
}

/// Reporter that emits the failure through the tracing subscriber.
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, stage: &str, error: &PipelineError) {
        error!(stage = stage, error = %error, "pipeline stage failed");
    }
}

/// Reporter that swallows everything. For tests.
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report(&self, _stage: &str, _error: &PipelineError) {}
}

/// Shared state handed to every stage entry point: the loaded
/// configuration plus the error reporter.
pub struct PipelineContext {
    pub config: AnalysisConfig,
    pub reporter: Box<dyn ErrorReporter>,
}

impl PipelineContext {
    pub fn new(config: AnalysisConfig, reporter: Box<dyn ErrorReporter>) -> Self {
        Self { config, reporter }
    }

    /// Context with a no-op reporter, for tests and embedding.
    pub fn silent(config: AnalysisConfig) -> Self {
        Self::new(config, Box::new(NoopReporter))
    }

    /// Report `err` for `stage` and hand it back, so stage wrappers can
    /// write `ctx.fail("match", err)?` style propagation.
    pub fn fail(&self, stage: &str, err: PipelineError) -> PipelineError {
        self.reporter.report(stage, &err);
        err
    }
}
