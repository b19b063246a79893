//! CarbonMatch - Avoided-emissions analysis for conservation sites
//!
//! This library estimates avoided emissions by comparing forest-loss
//! trajectories of protected sites against statistically matched control
//! pixels. The analysis runs as three stages communicating through
//! persisted artifacts, so an external scheduler can retry or parallelize
//! each stage independently:
//!
//! 1. [`extract`] - samples covariate raster layers over each site and its
//!    buffered surroundings, producing the pixel tables matching consumes.
//! 2. [`matching`] - pairs treatment pixels with comparable control pixels
//!    via propensity-score matching inside exact-match strata.
//! 3. [`summarize`] - converts matched-pair forest trajectories into
//!    per-site and global avoided-emissions estimates.
//!
//! # Example
//!
//! ```ignore
//! use carbonmatch::config::AnalysisConfig;
//! use carbonmatch::report::{LogReporter, PipelineContext};
//! use carbonmatch::raster::CovariateStack;
//!
//! let config = AnalysisConfig::load(&config_path)?;
//! let ctx = PipelineContext::new(config, Box::new(LogReporter));
//! let stack = CovariateStack::open_http(&ctx.config)?;
//! carbonmatch::extract::run_extraction(&ctx, &stack)?;
//! ```

pub mod artifacts;
pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod matching;
pub mod raster;
pub mod report;
pub mod sites;
pub mod summarize;

pub use error::PipelineError;

/// Version of the CarbonMatch library and CLI.
///
/// Synchronized across all workspace members via the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Biomass-to-carbon fraction (IPCC default). Fixed domain constant.
pub const CARBON_FRACTION: f64 = 0.5;

/// Molecular-weight ratio of CO2 to carbon (44/12), negated so that a
/// biomass loss yields positive emissions. Fixed domain constant.
pub const CO2_PER_CARBON: f64 = -3.67;
