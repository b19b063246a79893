//! Emissions summarization engine.
//!
//! Stage 3 of the pipeline. Reads every per-site match file, reconstructs
//! the forest-cover trajectory of each matched pair over the site's
//! intervention window, converts forest change to CO2-equivalent
//! emissions, and aggregates avoided quantities per site-year, per site,
//! and globally.
//!
//! Sign convention: forest loss yields positive emissions, and a pair's
//! avoided quantity is the control's magnitude minus the treatment's, so
//! a site outperforming its controls reports positive avoided emissions.

use crate::artifacts::{
    self, ArtifactPaths, MatchRecord, PixelLevelResult, ResultsSummary, SiteTotalResult,
    SiteYearResult, YearRange,
};
use crate::error::PipelineError;
use crate::report::PipelineContext;
use crate::sites::SiteMeta;
use crate::{CARBON_FRACTION, CO2_PER_CARBON};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Run the summarization stage end to end and write the four terminal
/// artifacts.
///
/// # Errors
///
/// `DataSufficiency` when no match files exist; summarization cannot
/// proceed without at least one matched site.
pub fn run_summarization(ctx: &PipelineContext) -> Result<ResultsSummary, PipelineError> {
    let config = &ctx.config;
    let paths = ArtifactPaths::new(config);
    paths.ensure_dirs()?;

    let sites = artifacts::read_sites_processed(&paths.sites_processed())?;
    let by_id: BTreeMap<&str, &SiteMeta> = sites.iter().map(|s| (s.site_id.as_str(), s)).collect();

    let files = artifacts::list_match_files(paths.matches_dir())?;
    if files.is_empty() {
        return Err(PipelineError::DataSufficiency(format!(
            "no match files found in {}",
            paths.matches_dir().display()
        )));
    }

    let mut site_years: Vec<SiteYearResult> = Vec::new();
    let mut site_totals: Vec<SiteTotalResult> = Vec::new();
    let mut pixel_rows: Vec<PixelLevelResult> = Vec::new();

    for (site_id, path) in &files {
        let site = by_id.get(site_id.as_str()).ok_or_else(|| {
            PipelineError::Schema(format!(
                "match file {} has no entry in the processed sites table",
                path.display()
            ))
        })?;
        let records = artifacts::read_match_table(path, &config.fc_years)?;
        summarize_site(
            site,
            &records,
            &config.fc_years,
            &mut site_years,
            &mut site_totals,
            &mut pixel_rows,
        )?;
    }

    let summary = ResultsSummary {
        task_id: config.task_id.clone(),
        n_sites: site_totals.len(),
        total_emissions_avoided_mgco2e: site_totals
            .iter()
            .map(|t| t.emissions_avoided_mgco2e)
            .sum(),
        total_forest_loss_avoided_ha: site_totals
            .iter()
            .map(|t| t.forest_loss_avoided_ha)
            .sum(),
        total_area_ha: site_totals.iter().map(|t| t.area_ha).sum(),
        year_range: YearRange {
            min: site_years.iter().map(|r| r.year).min().unwrap_or(0),
            max: site_years.iter().map(|r| r.year).max().unwrap_or(0),
        },
    };

    artifacts::write_csv_rows(&paths.results_by_site_year(), &site_years)?;
    artifacts::write_csv_rows(&paths.results_by_site_total(), &site_totals)?;
    artifacts::write_csv_rows(&paths.results_pixel_level(), &pixel_rows)?;
    artifacts::write_summary(&paths.results_summary(), &summary)?;

    info!(
        n_sites = summary.n_sites,
        total_emissions_avoided_mgco2e = summary.total_emissions_avoided_mgco2e,
        "summarization complete"
    );
    Ok(summary)
}

/// One matched pair, as indices into the record slice.
struct Pair<'a> {
    treatment: &'a MatchRecord,
    control: &'a MatchRecord,
}

fn pairs_of(records: &[MatchRecord]) -> Result<Vec<Pair<'_>>, PipelineError> {
    let mut groups: BTreeMap<u64, (Option<&MatchRecord>, Option<&MatchRecord>)> = BTreeMap::new();
    for r in records {
        let slot = groups.entry(r.group).or_default();
        let side = if r.treatment { &mut slot.0 } else { &mut slot.1 };
        if side.replace(r).is_some() {
            return Err(PipelineError::Schema(format!(
                "match group {} has duplicate {} rows",
                r.group,
                if r.treatment { "treatment" } else { "control" }
            )));
        }
    }
    groups
        .into_iter()
        .map(|(group, (t, c))| match (t, c) {
            (Some(treatment), Some(control)) => Ok(Pair { treatment, control }),
            _ => Err(PipelineError::Schema(format!(
                "match group {group} is missing one side of the pair"
            ))),
        })
        .collect()
}

/// Trajectory of one pixel over the site's analysis years: for each year
/// after the baseline, the forest area, its change, and the implied
/// emissions. Years with a missing forest-cover value (or a missing
/// predecessor) are absent.
fn trajectory(
    record: &MatchRecord,
    fc_years: &[i32],
    years: &[i32],
) -> BTreeMap<i32, (f64, f64, f64)> {
    let mut out = BTreeMap::new();
    let Some(total_biomass) = record.total_biomass else {
        return out;
    };
    let fc_at = |year: i32| -> Option<f64> {
        let i = fc_years.iter().position(|y| *y == year)?;
        record.fc[i]
    };
    for w in years.windows(2) {
        let (prev, year) = (w[0], w[1]);
        let (Some(fc_prev), Some(fc)) = (fc_at(prev), fc_at(year)) else {
            continue;
        };
        let forest_ha = record.area_ha * fc;
        let forest_change_ha = record.area_ha * (fc - fc_prev);
        let emissions = total_biomass * (fc - fc_prev) * CARBON_FRACTION * CO2_PER_CARBON;
        out.insert(year, (forest_ha, forest_change_ha, emissions));
    }
    out
}

fn summarize_site(
    site: &SiteMeta,
    records: &[MatchRecord],
    fc_years: &[i32],
    site_years: &mut Vec<SiteYearResult>,
    site_totals: &mut Vec<SiteTotalResult>,
    pixel_rows: &mut Vec<PixelLevelResult>,
) -> Result<(), PipelineError> {
    let pairs = pairs_of(records)?;
    if pairs.is_empty() {
        warn!(site_id = %site.site_id, "match file contains no pairs");
        return Ok(());
    }
    let sampled_fraction = records[0].sampled_fraction;

    // Analysis years: the leading year seeds the baseline and is never
    // emitted; reporting stops at the site's end year.
    let years: Vec<i32> = fc_years
        .iter()
        .copied()
        .filter(|y| *y >= site.start_year - 1 && *y <= site.end_year)
        .collect();
    if years.len() < 2 {
        warn!(
            site_id = %site.site_id,
            start_year = site.start_year,
            "no forest-cover years within the site's analysis window"
        );
        return Ok(());
    }
    debug!(
        site_id = %site.site_id,
        pairs = pairs.len(),
        first = years[1],
        last = years[years.len() - 1],
        "summarizing site"
    );

    // (forest loss avoided, emissions avoided, contributing pairs)
    let mut per_year: BTreeMap<i32, (f64, f64, usize)> = BTreeMap::new();

    for pair in &pairs {
        let t = trajectory(pair.treatment, fc_years, &years);
        let c = trajectory(pair.control, fc_years, &years);

        for (record, traj) in [(pair.treatment, &t), (pair.control, &c)] {
            for (year, (forest_ha, forest_change_ha, emissions)) in traj {
                pixel_rows.push(PixelLevelResult {
                    site_id: site.site_id.clone(),
                    group: record.group,
                    cell: record.cell,
                    treatment: record.treatment,
                    year: *year,
                    forest_ha: *forest_ha,
                    forest_change_ha: *forest_change_ha,
                    emissions_mgco2e: *emissions,
                });
            }
        }

        // A year contributes only when both sides of the pair have a
        // defined change for it.
        for (year, (_, t_change, t_emissions)) in &t {
            let Some((_, c_change, c_emissions)) = c.get(year) else {
                continue;
            };
            let entry = per_year.entry(*year).or_default();
            entry.0 += c_change.abs() - t_change.abs();
            entry.1 += c_emissions.abs() - t_emissions.abs();
            entry.2 += 1;
        }
    }

    let mut total_loss = 0.0;
    let mut total_emissions = 0.0;
    let mut emitted_years: Vec<i32> = Vec::new();
    for (year, (loss, emissions, n_pairs)) in &per_year {
        let loss = loss / sampled_fraction;
        let emissions = emissions / sampled_fraction;
        site_years.push(SiteYearResult {
            site_id: site.site_id.clone(),
            site_name: site.site_name.clone(),
            year: *year,
            forest_loss_avoided_ha: loss,
            emissions_avoided_mgco2e: emissions,
            n_matched_pixels: *n_pairs,
            sampled_fraction,
        });
        total_loss += loss;
        total_emissions += emissions;
        emitted_years.push(*year);
    }
    if emitted_years.is_empty() {
        warn!(site_id = %site.site_id, "no pair-year had complete forest cover on both sides");
        return Ok(());
    }

    site_totals.push(SiteTotalResult {
        site_id: site.site_id.clone(),
        site_name: site.site_name.clone(),
        forest_loss_avoided_ha: total_loss,
        emissions_avoided_mgco2e: total_emissions,
        area_ha: site.area_ha,
        n_matched_pixels: pairs.len(),
        sampled_fraction,
        first_year: emitted_years[0],
        last_year: emitted_years[emitted_years.len() - 1],
        n_years: emitted_years.len(),
    });
    Ok(())
}
