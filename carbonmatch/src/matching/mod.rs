//! Propensity matching engine.
//!
//! Stage 2 of the pipeline. Consumes the extraction artifacts and writes
//! one `matches_{site_id}.csv` per site. Each site is an independent work
//! unit: runs are idempotent (an existing match file is left untouched)
//! and safe to execute in parallel across sites, so an external scheduler
//! can fan the stage out as an array job.
//!
//! Within a site, treatment pixels are paired 1:1 with control candidates
//! from the buffered surroundings. Pairing is exact on the stratification
//! variables and optimal on a propensity (or standardized covariate)
//! distance within each stratum.

pub mod assign;
pub mod model;

use crate::artifacts::{
    self, ArtifactPaths, MatchRecord, PixelRecord, TableSchema,
};
use crate::config::defaults::{
    DEFORESTATION_RATE_LOOKBACK_YEARS, DEFORESTATION_RATE_THRESHOLD_YEAR,
};
use crate::config::AnalysisConfig;
use crate::error::PipelineError;
use crate::report::PipelineContext;
use crate::sites::SiteMeta;
use model::{fit_propensity, propensity_distances, standardized_distances, ModelSpec};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Which sites one invocation of the matching stage covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnit {
    /// Every processed site, in `site_id` order.
    All,
    /// A single site by id.
    Site(String),
    /// The n-th processed site (zero-based), for array jobs.
    ArrayIndex(usize),
}

/// What happened for one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A match file already exists; nothing was recomputed.
    AlreadyComplete,
    /// A match file was written with this many 1:1 pairs.
    Written { pairs: usize },
    /// No pair could be formed; no file was written.
    NoViableMatches,
}

/// Run the matching stage for the requested work unit.
///
/// Returns the per-site outcomes in processing order. Missing extraction
/// artifacts are fatal; an individual site producing no pairs is not.
pub fn run_matching(
    ctx: &PipelineContext,
    unit: &WorkUnit,
) -> Result<Vec<(String, MatchOutcome)>, PipelineError> {
    let config = &ctx.config;
    let paths = ArtifactPaths::new(config);
    std::fs::create_dir_all(paths.matches_dir())?;

    let sites = artifacts::read_sites_processed(&paths.sites_processed())?;
    let selected = resolve_work_unit(unit, &sites)?;

    let schema = TableSchema::from_config(config);
    let pixels = artifacts::read_pixel_table(&paths.treatments_and_controls(), &schema)?;
    let key = artifacts::read_treatment_cell_key(&paths.treatment_cell_key())?;
    let key_cells: BTreeSet<u64> = key.iter().map(|c| c.cell).collect();
    let base_spec = ModelSpec::read(&paths.formula())?;

    let mut outcomes = Vec::with_capacity(selected.len());
    for site in selected {
        let out_path = paths.matches_for(&site.site_id);
        if out_path.exists() {
            debug!(site_id = %site.site_id, "match file exists, skipping");
            outcomes.push((site.site_id.clone(), MatchOutcome::AlreadyComplete));
            continue;
        }

        let outcome = match match_site(config, &schema, &base_spec, site, &pixels, &key_cells)? {
            Some(records) => {
                let pairs = records.len() / 2;
                write_atomically(&out_path, &schema.fc_years, &records)?;
                info!(site_id = %site.site_id, pairs, "match file written");
                MatchOutcome::Written { pairs }
            }
            None => {
                warn!(site_id = %site.site_id, "no viable matches");
                MatchOutcome::NoViableMatches
            }
        };
        outcomes.push((site.site_id.clone(), outcome));
    }
    Ok(outcomes)
}

fn resolve_work_unit<'a>(
    unit: &WorkUnit,
    sites: &'a [SiteMeta],
) -> Result<Vec<&'a SiteMeta>, PipelineError> {
    match unit {
        WorkUnit::All => Ok(sites.iter().collect()),
        WorkUnit::Site(id) => {
            let site = sites.iter().find(|s| &s.site_id == id).ok_or_else(|| {
                PipelineError::Configuration(format!("unknown site_id '{id}'"))
            })?;
            Ok(vec![site])
        }
        WorkUnit::ArrayIndex(i) => {
            let site = sites.get(*i).ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "array index {i} out of range for {} sites",
                    sites.len()
                ))
            })?;
            Ok(vec![site])
        }
    }
}

/// Candidate pixel with its complete covariate row and stratum key.
struct Candidate {
    record: PixelRecord,
    covs: Vec<f64>,
    stratum: Vec<i64>,
}

/// Match one site. `None` means no pairs could be formed.
fn match_site(
    config: &AnalysisConfig,
    schema: &TableSchema,
    base_spec: &ModelSpec,
    site: &SiteMeta,
    pixels: &[PixelRecord],
    key_cells: &BTreeSet<u64>,
) -> Result<Option<Vec<MatchRecord>>, PipelineError> {
    let rate_years = deforestation_rate_years(site, &schema.fc_years);
    let spec = base_spec.clone().with_deforestation_rate(rate_years.is_some());
    debug!(site_id = %site.site_id, terms = ?spec.terms, "model specification");

    // Candidate pools grouped by stratum. Treatment pixels belong to this
    // site; control candidates come from the whole pixel table regardless
    // of which site's buffer emitted the row, restricted to the site's
    // strata by the grouping itself. Cells inside any site's treatment
    // area never enter a control pool, including contested cells flagged
    // treatment for neither owner.
    let mut strata: BTreeMap<Vec<i64>, (Vec<Candidate>, Vec<Candidate>)> = BTreeMap::new();
    let mut dropped_na = 0usize;
    let mut n_treatment_total = 0usize;

    for r in pixels {
        if r.treatment {
            if r.site_id != site.site_id {
                continue;
            }
        } else if key_cells.contains(&r.cell) {
            continue;
        }
        match candidate(r, schema, rate_years) {
            Some(c) => {
                let pools = strata.entry(c.stratum.clone()).or_default();
                if r.treatment {
                    n_treatment_total += 1;
                    pools.0.push(c);
                } else {
                    pools.1.push(c);
                }
            }
            None => dropped_na += 1,
        }
    }
    if dropped_na > 0 {
        warn!(
            site_id = %site.site_id,
            dropped = dropped_na,
            "candidates dropped for incomplete covariates"
        );
    }
    if n_treatment_total == 0 {
        return Ok(None);
    }

    // Deterministic per-stratum subsampling keeps large sites tractable.
    // The retained treatment fraction travels with every match row so the
    // summarizer can rescale site totals back up.
    let mut rng = StdRng::seed_from_u64(site_seed(config.seed, &site.site_id));
    let mut n_treatment_kept = 0usize;
    let mut pairs: Vec<(Candidate, Candidate)> = Vec::new();

    for (stratum, (t_pool, c_pool)) in strata {
        if t_pool.is_empty() || c_pool.is_empty() {
            debug!(site_id = %site.site_id, stratum = ?stratum, "stratum unmatched");
            continue;
        }
        let treat = sample_cap(t_pool, config.max_treatment_pixels, &mut rng);
        let control = sample_cap(c_pool, config.control_multiplier * treat.len(), &mut rng);
        n_treatment_kept += treat.len();
        pairs.extend(pair_stratum(config, treat, control));
    }
    if pairs.is_empty() {
        return Ok(None);
    }
    let sampled_fraction = n_treatment_kept as f64 / n_treatment_total as f64;

    let mut records = Vec::with_capacity(pairs.len() * 2);
    for (t, c) in &pairs {
        let group = t.record.cell;
        records.push(match_record(group, site, &t.record, sampled_fraction));
        records.push(match_record(group, site, &c.record, sampled_fraction));
    }
    records.sort_by(|a, b| (a.group, !a.treatment).cmp(&(b.group, !b.treatment)));
    Ok(Some(records))
}

/// Estimation and lookback year column indices when the pre-intervention
/// deforestation rate is computable for this site.
fn deforestation_rate_years(site: &SiteMeta, fc_years: &[i32]) -> Option<(usize, usize)> {
    if site.start_year < DEFORESTATION_RATE_THRESHOLD_YEAR {
        return None;
    }
    let est = fc_years.iter().position(|y| *y == site.start_year)?;
    let pre = fc_years
        .iter()
        .position(|y| *y == site.start_year - DEFORESTATION_RATE_LOOKBACK_YEARS)?;
    Some((est, pre))
}

/// Build a candidate from a pixel row, or `None` when any required value
/// is missing (incomplete rows cannot enter the model or the emissions
/// accounting).
fn candidate(
    r: &PixelRecord,
    schema: &TableSchema,
    rate_years: Option<(usize, usize)>,
) -> Option<Candidate> {
    r.total_biomass?;
    let stratum: Option<Vec<i64>> = r.strata.iter().map(|v| v.map(|x| x.round() as i64)).collect();
    let mut covs: Vec<f64> = Vec::with_capacity(schema.covariates.len() + 1);
    for v in &r.covariates {
        covs.push((*v)?);
    }
    if let Some((est, pre)) = rate_years {
        let est_fc = r.fc[est]?;
        let pre_fc = r.fc[pre]?;
        if pre_fc <= 0.0 {
            return None;
        }
        covs.push((est_fc - pre_fc) / pre_fc * 100.0);
    }
    Some(Candidate {
        record: r.clone(),
        covs,
        stratum: stratum?,
    })
}

/// Optimal 1:1 pairs within one stratum. When treatments outnumber
/// controls the cost matrix is transposed so every control is used
/// exactly once; unmatched treatments simply drop out of the stratum.
fn pair_stratum(
    config: &AnalysisConfig,
    treat: Vec<Candidate>,
    control: Vec<Candidate>,
) -> Vec<(Candidate, Candidate)> {
    let cost = stratum_distances(config, &treat, &control);
    let assigned: Vec<(usize, usize)> = if treat.len() <= control.len() {
        assign::assign(&cost).into_iter().enumerate().collect()
    } else {
        let flipped: Vec<Vec<f64>> = (0..control.len())
            .map(|j| (0..treat.len()).map(|i| cost[i][j]).collect())
            .collect();
        assign::assign(&flipped)
            .into_iter()
            .enumerate()
            .map(|(j, i)| (i, j))
            .collect()
    };

    let mut treat: Vec<Option<Candidate>> = treat.into_iter().map(Some).collect();
    let mut control: Vec<Option<Candidate>> = control.into_iter().map(Some).collect();
    assigned
        .into_iter()
        // Safe: assign returns distinct rows and columns
        .map(|(i, j)| (treat[i].take().unwrap(), control[j].take().unwrap()))
        .collect()
}

/// Distance matrix for one stratum: fitted propensity-score differences
/// when the stratum has enough treatment pixels for a stable binomial
/// fit, else standardized distance on the raw covariates. A failed fit
/// also falls back to the covariate distance.
fn stratum_distances(
    config: &AnalysisConfig,
    treat: &[Candidate],
    control: &[Candidate],
) -> Vec<Vec<f64>> {
    if treat.len() >= config.min_glm_treatment_pixels {
        let rows: Vec<Vec<f64>> = treat
            .iter()
            .chain(control.iter())
            .map(|c| c.covs.clone())
            .collect();
        let labels: Vec<bool> = treat
            .iter()
            .map(|_| true)
            .chain(control.iter().map(|_| false))
            .collect();
        if let Some(scores) = fit_propensity(&rows, &labels) {
            return propensity_distances(&scores[..treat.len()], &scores[treat.len()..]);
        }
        debug!("propensity fit failed, using covariate distance");
    }
    let t: Vec<Vec<f64>> = treat.iter().map(|c| c.covs.clone()).collect();
    let c: Vec<Vec<f64>> = control.iter().map(|c| c.covs.clone()).collect();
    standardized_distances(&t, &c)
}

fn match_record(
    group: u64,
    site: &SiteMeta,
    r: &PixelRecord,
    sampled_fraction: f64,
) -> MatchRecord {
    MatchRecord {
        group,
        site_id: site.site_id.clone(),
        id_numeric: site.id_numeric,
        cell: r.cell,
        treatment: r.treatment,
        area_ha: r.area_ha,
        total_biomass: r.total_biomass,
        fc: r.fc.clone(),
        sampled_fraction,
    }
}

/// Retain at most `cap` items, chosen uniformly without replacement in
/// original order.
fn sample_cap<T>(items: Vec<T>, cap: usize, rng: &mut StdRng) -> Vec<T> {
    if items.len() <= cap {
        return items;
    }
    let mut keep = vec![false; items.len()];
    for i in rand::seq::index::sample(rng, items.len(), cap) {
        keep[i] = true;
    }
    items
        .into_iter()
        .zip(keep)
        .filter_map(|(x, k)| k.then_some(x))
        .collect()
}

/// Per-site RNG seed: the run seed folded with an FNV-1a hash of the site
/// id, so site results do not depend on which other sites run alongside.
fn site_seed(seed: u64, site_id: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in site_id.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    seed ^ h
}

/// Write the match table via a temp file and rename, so a concurrent
/// reader never observes a partial file.
fn write_atomically(
    path: &std::path::Path,
    fc_years: &[i32],
    records: &[MatchRecord],
) -> Result<(), PipelineError> {
    let tmp = path.with_extension("csv.tmp");
    artifacts::write_match_table(&tmp, fc_years, records)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::PipelineContext;
    use std::path::PathBuf;

    fn config(data_dir: PathBuf) -> AnalysisConfig {
        serde_json::from_str::<AnalysisConfig>(&format!(
            r#"{{
                "data_dir": {:?},
                "gcs_bucket": "bucket",
                "gcs_prefix": "prefix",
                "covariates": ["elev"],
                "exact_match_vars": ["region"],
                "fc_years": [2000, 2001]
            }}"#,
            data_dir
        ))
        .unwrap()
    }

    fn site_meta(site_id: &str, start_year: i32) -> SiteMeta {
        SiteMeta {
            site_id: site_id.to_string(),
            site_name: format!("Site {site_id}"),
            start_date: format!("{start_year}-01-01"),
            end_date: None,
            start_year,
            end_year: 9999,
            area_ha: 5000.0,
            id_numeric: 1,
        }
    }

    fn pixel(cell: u64, site_id: &str, treatment: bool, region: f64, elev: f64) -> PixelRecord {
        PixelRecord {
            cell,
            site_id: site_id.to_string(),
            treatment,
            area_ha: 85.0,
            strata: vec![Some(region)],
            total_biomass: Some(100.0),
            covariates: vec![Some(elev)],
            fc: vec![Some(0.9), Some(0.8)],
        }
    }

    fn schema() -> TableSchema {
        TableSchema {
            exact_match_vars: vec!["region".into()],
            covariates: vec!["elev".into()],
            fc_years: vec![2000, 2001],
        }
    }

    fn base_spec() -> ModelSpec {
        ModelSpec::new(vec!["elev".into()])
    }

    #[test]
    fn pairs_nearest_covariate_within_stratum() {
        let cfg = config(PathBuf::from("/unused"));
        let site = site_meta("alpha", 2001);
        // Two treatments, three controls, far below the GLM threshold, so
        // pairing uses the standardized covariate distance.
        let pixels = vec![
            pixel(1, "alpha", true, 3.0, 100.0),
            pixel(2, "alpha", true, 3.0, 200.0),
            pixel(10, "alpha", false, 3.0, 105.0),
            pixel(11, "alpha", false, 3.0, 195.0),
            pixel(12, "alpha", false, 3.0, 500.0),
        ];
        let records = match_site(&cfg, &schema(), &base_spec(), &site, &pixels, &BTreeSet::new())
            .unwrap()
            .unwrap();
        assert_eq!(records.len(), 4);

        let control_for = |group: u64| {
            records
                .iter()
                .find(|r| r.group == group && !r.treatment)
                .unwrap()
                .cell
        };
        assert_eq!(control_for(1), 10);
        assert_eq!(control_for(2), 11);
        assert!(records.iter().all(|r| (r.sampled_fraction - 1.0).abs() < 1e-12));
    }

    #[test]
    fn controls_only_match_their_own_stratum() {
        let cfg = config(PathBuf::from("/unused"));
        let site = site_meta("alpha", 2001);
        // The only control in region 3 is a poor covariate match, but the
        // near-identical control in region 4 must never be used.
        let pixels = vec![
            pixel(1, "alpha", true, 3.0, 100.0),
            pixel(10, "alpha", false, 4.0, 100.0),
            pixel(11, "alpha", false, 3.0, 900.0),
        ];
        let records = match_site(&cfg, &schema(), &base_spec(), &site, &pixels, &BTreeSet::new())
            .unwrap()
            .unwrap();
        let control = records.iter().find(|r| !r.treatment).unwrap();
        assert_eq!(control.cell, 11);
    }

    #[test]
    fn controls_sampled_through_another_sites_buffer_are_eligible() {
        let cfg = config(PathBuf::from("/unused"));
        let site = site_meta("beta", 2001);
        // The only control row shares the stratum but was emitted through
        // a neighboring site's buffer and carries that site's id.
        let pixels = vec![
            pixel(2, "beta", true, 3.0, 100.0),
            pixel(10, "alpha", false, 3.0, 105.0),
        ];
        let records = match_site(&cfg, &schema(), &base_spec(), &site, &pixels, &BTreeSet::new())
            .unwrap()
            .unwrap();
        assert_eq!(records.len(), 2);
        let control = records.iter().find(|r| !r.treatment).unwrap();
        assert_eq!(control.cell, 10);
        assert_eq!(control.site_id, "beta");
    }

    #[test]
    fn one_sided_strata_emit_no_rows() {
        let cfg = config(PathBuf::from("/unused"));
        let site = site_meta("alpha", 2001);
        // Region 3 has both sides; region 5 has only a treatment pixel and
        // region 7 only a control, so neither can produce a pair.
        let pixels = vec![
            pixel(1, "alpha", true, 3.0, 100.0),
            pixel(10, "alpha", false, 3.0, 110.0),
            pixel(2, "alpha", true, 5.0, 100.0),
            pixel(20, "alpha", false, 7.0, 100.0),
        ];
        let records = match_site(&cfg, &schema(), &base_spec(), &site, &pixels, &BTreeSet::new())
            .unwrap()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.group == 1));
        let cells: Vec<u64> = records.iter().map(|r| r.cell).collect();
        assert_eq!(cells, vec![1, 10]);
        // The unmatched treatment still counts in the denominator.
        assert!(records.iter().all(|r| (r.sampled_fraction - 0.5).abs() < 1e-12));
    }

    #[test]
    fn treatment_area_cells_never_enter_control_pool() {
        let cfg = config(PathBuf::from("/unused"));
        let site = site_meta("alpha", 2001);
        let pixels = vec![
            pixel(1, "alpha", true, 3.0, 100.0),
            // Perfect covariate match, but inside another site's
            // treatment area (present in the cell key).
            pixel(10, "alpha", false, 3.0, 100.0),
            pixel(11, "alpha", false, 3.0, 300.0),
        ];
        let key_cells: BTreeSet<u64> = [10].into();
        let records = match_site(&cfg, &schema(), &base_spec(), &site, &pixels, &key_cells)
            .unwrap()
            .unwrap();
        let control = records.iter().find(|r| !r.treatment).unwrap();
        assert_eq!(control.cell, 11);
    }

    #[test]
    fn incomplete_rows_are_dropped() {
        let cfg = config(PathBuf::from("/unused"));
        let site = site_meta("alpha", 2001);
        let mut broken = pixel(10, "alpha", false, 3.0, 100.0);
        broken.covariates = vec![None];
        let pixels = vec![
            pixel(1, "alpha", true, 3.0, 100.0),
            broken,
            pixel(11, "alpha", false, 3.0, 120.0),
        ];
        let records = match_site(&cfg, &schema(), &base_spec(), &site, &pixels, &BTreeSet::new())
            .unwrap()
            .unwrap();
        let control = records.iter().find(|r| !r.treatment).unwrap();
        assert_eq!(control.cell, 11);
    }

    #[test]
    fn no_controls_means_no_matches() {
        let cfg = config(PathBuf::from("/unused"));
        let site = site_meta("alpha", 2001);
        let pixels = vec![pixel(1, "alpha", true, 3.0, 100.0)];
        let result = match_site(&cfg, &schema(), &base_spec(), &site, &pixels, &BTreeSet::new())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn deforestation_rate_requires_threshold_and_years() {
        let fc_years = vec![2000, 2001, 2005, 2010];
        // Pre-threshold start year: never augmented.
        assert_eq!(
            deforestation_rate_years(&site_meta("a", 2001), &fc_years),
            None
        );
        // 2010 and 2005 both present: augmented.
        assert_eq!(
            deforestation_rate_years(&site_meta("a", 2010), &fc_years),
            Some((3, 2))
        );
        // Establishment year missing from the series.
        assert_eq!(
            deforestation_rate_years(&site_meta("a", 2006), &fc_years),
            None
        );
        // Lookback year missing from the series.
        assert_eq!(
            deforestation_rate_years(&site_meta("a", 2010), &[2000, 2001, 2010]),
            None
        );
    }

    #[test]
    fn site_seed_is_stable_and_site_specific() {
        let a = site_seed(42, "alpha");
        assert_eq!(a, site_seed(42, "alpha"));
        assert_ne!(a, site_seed(42, "beta"));
        assert_ne!(a, site_seed(43, "alpha"));
    }

    #[test]
    fn sample_cap_is_deterministic_and_ordered() {
        let items: Vec<u32> = (0..100).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let picked = sample_cap(items.clone(), 10, &mut rng);
        assert_eq!(picked.len(), 10);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));

        let mut rng2 = StdRng::seed_from_u64(7);
        assert_eq!(picked, sample_cap(items, 10, &mut rng2));
    }

    #[test]
    fn run_matching_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf());
        let paths = ArtifactPaths::new(&cfg);
        paths.ensure_dirs().unwrap();

        let sites = vec![site_meta("alpha", 2001)];
        artifacts::write_sites_processed(&paths.sites_processed(), &sites).unwrap();
        let pixels = vec![
            pixel(1, "alpha", true, 3.0, 100.0),
            pixel(10, "alpha", false, 3.0, 110.0),
        ];
        artifacts::write_pixel_table(&paths.treatments_and_controls(), &schema(), &pixels)
            .unwrap();
        artifacts::write_treatment_cell_key(
            &paths.treatment_cell_key(),
            &[artifacts::TreatmentCell {
                site_id: "alpha".into(),
                cell: 1,
                area_ha: 85.0,
                region: 3.0,
            }],
        )
        .unwrap();
        base_spec().write(&paths.formula()).unwrap();

        let ctx = PipelineContext::silent(cfg);
        let first = run_matching(&ctx, &WorkUnit::All).unwrap();
        assert_eq!(first, vec![("alpha".into(), MatchOutcome::Written { pairs: 1 })]);
        let bytes = std::fs::read(paths.matches_for("alpha")).unwrap();

        let second = run_matching(&ctx, &WorkUnit::All).unwrap();
        assert_eq!(second, vec![("alpha".into(), MatchOutcome::AlreadyComplete)]);
        assert_eq!(std::fs::read(paths.matches_for("alpha")).unwrap(), bytes);
    }

    #[test]
    fn array_index_out_of_range_is_configuration_error() {
        let sites = vec![site_meta("alpha", 2001)];
        let err = resolve_work_unit(&WorkUnit::ArrayIndex(5), &sites).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        let ok = resolve_work_unit(&WorkUnit::ArrayIndex(0), &sites).unwrap();
        assert_eq!(ok[0].site_id, "alpha");
    }
}
