//! CarbonMatch CLI - Command-line interface
//!
//! This binary drives the avoided-emissions pipeline stage by stage, or
//! end to end with `run`. Each invocation loads one JSON config; batch
//! schedulers can fan the match stage out across sites with
//! `--array-index` or the `AE_ARRAY_INDEX` environment variable.

mod error;

use carbonmatch::config::AnalysisConfig;
use carbonmatch::logging::init_logging;
use carbonmatch::matching::{run_matching, MatchOutcome, WorkUnit};
use carbonmatch::raster::CovariateStack;
use carbonmatch::report::{LogReporter, PipelineContext};
use carbonmatch::summarize::run_summarization;
use clap::{Parser, Subcommand};
use error::CliError;
use std::path::PathBuf;
use tracing::info;

/// Environment variable batch schedulers use to address one site per
/// array task.
const ARRAY_INDEX_ENV: &str = "AE_ARRAY_INDEX";

#[derive(Parser)]
#[command(name = "carbonmatch")]
#[command(version = carbonmatch::VERSION)]
#[command(about = "Avoided-emissions analysis for conservation sites", long_about = None)]
struct Cli {
    /// Analysis configuration JSON file
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Override the config's data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sample covariate rasters over every site and write the pixel tables
    Extract {
        /// Read rasters from a local directory instead of cloud storage
        #[arg(long)]
        layers_dir: Option<PathBuf>,
    },
    /// Pair treatment pixels with matched controls, one file per site
    Match {
        /// Match a single site by id
        #[arg(long, conflicts_with = "array_index")]
        site_id: Option<String>,

        /// Match the n-th processed site (zero-based); also read from
        /// the AE_ARRAY_INDEX environment variable
        #[arg(long)]
        array_index: Option<usize>,
    },
    /// Aggregate match files into avoided-emissions results
    Summarize,
    /// Run all three stages in sequence
    Run {
        /// Read rasters from a local directory instead of cloud storage
        #[arg(long)]
        layers_dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        e.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = AnalysisConfig::load(&cli.config).map_err(|e| CliError::Stage {
        stage: "config",
        error: e,
    })?;
    let config = match cli.data_dir {
        Some(dir) => config.with_data_dir(dir),
        None => config,
    };

    let _guard = init_logging(&config.data_dir.join("logs"))
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;
    info!(version = carbonmatch::VERSION, "carbonmatch starting");

    let ctx = PipelineContext::new(config, Box::new(LogReporter));
    match cli.command {
        Command::Extract { layers_dir } => extract(&ctx, layers_dir.as_deref()),
        Command::Match {
            site_id,
            array_index,
        } => match_sites(&ctx, resolve_work_unit(&ctx, site_id, array_index)?),
        Command::Summarize => summarize(&ctx),
        Command::Run { layers_dir } => {
            extract(&ctx, layers_dir.as_deref())?;
            match_sites(&ctx, WorkUnit::All)?;
            summarize(&ctx)
        }
    }
}

fn stage_err<'a>(
    ctx: &'a PipelineContext,
    stage: &'static str,
) -> impl Fn(carbonmatch::PipelineError) -> CliError + 'a {
    move |error| CliError::Stage {
        stage,
        error: ctx.fail(stage, error),
    }
}

fn extract(ctx: &PipelineContext, layers_dir: Option<&std::path::Path>) -> Result<(), CliError> {
    let stack = match layers_dir {
        Some(dir) => CovariateStack::open_dir(&ctx.config, dir),
        None => CovariateStack::open_http(&ctx.config),
    }
    .map_err(stage_err(ctx, "extract"))?;

    let summary =
        carbonmatch::extract::run_extraction(ctx, &stack).map_err(stage_err(ctx, "extract"))?;
    println!(
        "Extracted {} pixels across {} sites ({} treatment cells)",
        summary.n_pixels, summary.n_sites, summary.n_treatment_cells
    );
    Ok(())
}

/// Site selection precedence: explicit --site-id, then --array-index,
/// then the scheduler's environment variable, then the config's
/// `site_id`, and finally every site.
fn resolve_work_unit(
    ctx: &PipelineContext,
    site_id: Option<String>,
    array_index: Option<usize>,
) -> Result<WorkUnit, CliError> {
    if let Some(id) = site_id {
        return Ok(WorkUnit::Site(id));
    }
    if let Some(i) = array_index {
        return Ok(WorkUnit::ArrayIndex(i));
    }
    if let Ok(raw) = std::env::var(ARRAY_INDEX_ENV) {
        let i = raw.parse().map_err(|_| {
            CliError::Usage(format!("{ARRAY_INDEX_ENV} must be an integer, got '{raw}'"))
        })?;
        return Ok(WorkUnit::ArrayIndex(i));
    }
    if let Some(id) = &ctx.config.site_id {
        return Ok(WorkUnit::Site(id.clone()));
    }
    Ok(WorkUnit::All)
}

fn match_sites(ctx: &PipelineContext, unit: WorkUnit) -> Result<(), CliError> {
    let outcomes = run_matching(ctx, &unit).map_err(stage_err(ctx, "match"))?;
    for (site_id, outcome) in &outcomes {
        match outcome {
            MatchOutcome::Written { pairs } => {
                println!("{site_id}: {pairs} matched pairs written")
            }
            MatchOutcome::AlreadyComplete => println!("{site_id}: already complete, skipped"),
            MatchOutcome::NoViableMatches => println!("{site_id}: no viable matches"),
        }
    }
    Ok(())
}

fn summarize(ctx: &PipelineContext) -> Result<(), CliError> {
    let summary = run_summarization(ctx).map_err(stage_err(ctx, "summarize"))?;
    println!(
        "Summarized {} sites: {:.1} MgCO2e avoided, {:.1} ha forest loss avoided ({}..{})",
        summary.n_sites,
        summary.total_emissions_avoided_mgco2e,
        summary.total_forest_loss_avoided_ha,
        summary.year_range.min,
        summary.year_range.max
    );
    Ok(())
}
