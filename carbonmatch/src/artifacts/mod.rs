//! Persisted artifacts shared between pipeline stages.
//!
//! Stages never hand data to each other in process; everything flows
//! through these files so an external scheduler can retry or parallelize
//! stages independently:
//!
//! - `input/sites_processed.json` - processed site table (no geometry)
//! - `input/site_id_key.csv` - human-auditable id mapping
//! - `input/treatment_cell_key.csv` - raster cells per site
//! - `input/treatments_and_controls.csv` - the combined pixel table
//! - `input/formula.json` - base matching model specification
//! - `matches/matches_{site_id}.csv` - per-site match groups
//! - `output/results_*.csv|json` - terminal results
//!
//! The pixel and match tables carry dynamic covariate and forest-cover
//! columns, so they are written through raw CSV records rather than a
//! fixed serde struct.

use crate::config::{fc_layer_name, AnalysisConfig};
use crate::error::PipelineError;
use crate::sites::SiteMeta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolved artifact locations for one run.
pub struct ArtifactPaths {
    input_dir: PathBuf,
    output_dir: PathBuf,
    matches_dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            input_dir: config.input_dir(),
            output_dir: config.output_dir(),
            matches_dir: config.matches_dir(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.input_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(&self.matches_dir)?;
        Ok(())
    }

    pub fn sites_processed(&self) -> PathBuf {
        self.input_dir.join("sites_processed.json")
    }
    pub fn site_id_key(&self) -> PathBuf {
        self.input_dir.join("site_id_key.csv")
    }
    pub fn treatment_cell_key(&self) -> PathBuf {
        self.input_dir.join("treatment_cell_key.csv")
    }
    pub fn treatments_and_controls(&self) -> PathBuf {
        self.input_dir.join("treatments_and_controls.csv")
    }
    pub fn formula(&self) -> PathBuf {
        self.input_dir.join("formula.json")
    }
    pub fn matches_for(&self, site_id: &str) -> PathBuf {
        self.matches_dir.join(format!("matches_{site_id}.csv"))
    }
    pub fn matches_dir(&self) -> &Path {
        &self.matches_dir
    }
    pub fn results_by_site_year(&self) -> PathBuf {
        self.output_dir.join("results_by_site_year.csv")
    }
    pub fn results_by_site_total(&self) -> PathBuf {
        self.output_dir.join("results_by_site_total.csv")
    }
    pub fn results_pixel_level(&self) -> PathBuf {
        self.output_dir.join("results_pixel_level.csv")
    }
    pub fn results_summary(&self) -> PathBuf {
        self.output_dir.join("results_summary.json")
    }
}

// ---------------------------------------------------------------------------
// Pixel table
// ---------------------------------------------------------------------------

/// Column layout of the pixel and match tables. Strata and covariate
/// columns are config-driven; forest-cover columns are one per year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub exact_match_vars: Vec<String>,
    pub covariates: Vec<String>,
    pub fc_years: Vec<i32>,
}

impl TableSchema {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            exact_match_vars: config.exact_match_vars.clone(),
            covariates: config.covariates.clone(),
            fc_years: config.fc_years.clone(),
        }
    }
}

/// One row of the combined pixel table: a raster cell sampled within a
/// site's buffered extent.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelRecord {
    pub cell: u64,
    pub site_id: String,
    pub treatment: bool,
    pub area_ha: f64,
    /// Values of the exact-match variables, in schema order.
    pub strata: Vec<Option<f64>>,
    pub total_biomass: Option<f64>,
    /// Covariate values, in schema order.
    pub covariates: Vec<Option<f64>>,
    /// Forest-cover fraction per year, in schema order.
    pub fc: Vec<Option<f64>>,
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) => format!("{x}"),
        None => String::new(),
    }
}

fn parse_opt(s: &str) -> Option<f64> {
    if s.is_empty() {
        None
    } else {
        s.parse().ok()
    }
}

fn parse_req<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, PipelineError> {
    s.parse()
        .map_err(|_| PipelineError::Schema(format!("bad {what} value '{s}'")))
}

/// Write the combined pixel table.
pub fn write_pixel_table(
    path: &Path,
    schema: &TableSchema,
    records: &[PixelRecord],
) -> Result<(), PipelineError> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec![
        "cell".to_string(),
        "site_id".to_string(),
        "treatment".to_string(),
        "area_ha".to_string(),
    ];
    header.extend(schema.exact_match_vars.iter().cloned());
    header.push("total_biomass".to_string());
    header.extend(schema.covariates.iter().cloned());
    header.extend(schema.fc_years.iter().map(|y| fc_layer_name(*y)));
    writer.write_record(&header)?;

    for r in records {
        let mut row = vec![
            r.cell.to_string(),
            r.site_id.clone(),
            if r.treatment { "1" } else { "0" }.to_string(),
            format!("{}", r.area_ha),
        ];
        row.extend(r.strata.iter().map(|v| fmt_opt(*v)));
        row.push(fmt_opt(r.total_biomass));
        row.extend(r.covariates.iter().map(|v| fmt_opt(*v)));
        row.extend(r.fc.iter().map(|v| fmt_opt(*v)));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read the combined pixel table, validating it against the schema.
pub fn read_pixel_table(
    path: &Path,
    schema: &TableSchema,
) -> Result<Vec<PixelRecord>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MissingArtifact(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let n_strata = schema.exact_match_vars.len();
    let n_cov = schema.covariates.len();
    let n_fc = schema.fc_years.len();
    let expected_cols = 4 + n_strata + 1 + n_cov + n_fc;

    let headers = reader.headers()?.clone();
    if headers.len() != expected_cols {
        return Err(PipelineError::Schema(format!(
            "pixel table {} has {} columns, expected {expected_cols}",
            path.display(),
            headers.len()
        )));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let field = |i: usize| row.get(i).unwrap_or("");
        let mut at = 4;
        let strata: Vec<Option<f64>> = (0..n_strata).map(|i| parse_opt(field(at + i))).collect();
        at += n_strata;
        let total_biomass = parse_opt(field(at));
        at += 1;
        let covariates: Vec<Option<f64>> = (0..n_cov).map(|i| parse_opt(field(at + i))).collect();
        at += n_cov;
        let fc: Vec<Option<f64>> = (0..n_fc).map(|i| parse_opt(field(at + i))).collect();

        records.push(PixelRecord {
            cell: parse_req(field(0), "cell")?,
            site_id: field(1).to_string(),
            treatment: field(2) == "1" || field(2) == "true",
            area_ha: parse_req(field(3), "area_ha")?,
            strata,
            total_biomass,
            covariates,
            fc,
        });
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Treatment cell key
// ---------------------------------------------------------------------------

/// Mapping of one raster cell to the site whose polygon contains it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreatmentCell {
    pub site_id: String,
    pub cell: u64,
    pub area_ha: f64,
    pub region: f64,
}

pub fn write_treatment_cell_key(
    path: &Path,
    cells: &[TreatmentCell],
) -> Result<(), PipelineError> {
    let mut writer = csv::Writer::from_path(path)?;
    for c in cells {
        writer.serialize(c)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_treatment_cell_key(path: &Path) -> Result<Vec<TreatmentCell>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MissingArtifact(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut cells = Vec::new();
    for row in reader.deserialize() {
        cells.push(row?);
    }
    Ok(cells)
}

// ---------------------------------------------------------------------------
// Sites and id key
// ---------------------------------------------------------------------------

pub fn write_sites_processed(path: &Path, sites: &[SiteMeta]) -> Result<(), PipelineError> {
    let text = serde_json::to_string_pretty(sites)?;
    std::fs::write(path, text)?;
    Ok(())
}

pub fn read_sites_processed(path: &Path) -> Result<Vec<SiteMeta>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MissingArtifact(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SiteKeyRow {
    pub site_id: String,
    pub id_numeric: u32,
    pub site_name: String,
}

pub fn write_site_id_key(path: &Path, sites: &[SiteMeta]) -> Result<(), PipelineError> {
    let mut writer = csv::Writer::from_path(path)?;
    for s in sites {
        writer.serialize(SiteKeyRow {
            site_id: s.site_id.clone(),
            id_numeric: s.id_numeric,
            site_name: s.site_name.clone(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Match groups
// ---------------------------------------------------------------------------

/// One flattened pixel row of a match group. Each 1:1 pair contributes two
/// rows sharing a `group` key (the treatment pixel's cell id).
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub group: u64,
    pub site_id: String,
    pub id_numeric: u32,
    pub cell: u64,
    pub treatment: bool,
    pub area_ha: f64,
    pub total_biomass: Option<f64>,
    pub fc: Vec<Option<f64>>,
    pub sampled_fraction: f64,
}

pub fn write_match_table(
    path: &Path,
    fc_years: &[i32],
    records: &[MatchRecord],
) -> Result<(), PipelineError> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec![
        "group".to_string(),
        "site_id".to_string(),
        "id_numeric".to_string(),
        "cell".to_string(),
        "treatment".to_string(),
        "area_ha".to_string(),
        "total_biomass".to_string(),
    ];
    header.extend(fc_years.iter().map(|y| fc_layer_name(*y)));
    header.push("sampled_fraction".to_string());
    writer.write_record(&header)?;

    for r in records {
        let mut row = vec![
            r.group.to_string(),
            r.site_id.clone(),
            r.id_numeric.to_string(),
            r.cell.to_string(),
            if r.treatment { "1" } else { "0" }.to_string(),
            format!("{}", r.area_ha),
            fmt_opt(r.total_biomass),
        ];
        row.extend(r.fc.iter().map(|v| fmt_opt(*v)));
        row.push(format!("{}", r.sampled_fraction));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_match_table(
    path: &Path,
    fc_years: &[i32],
) -> Result<Vec<MatchRecord>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MissingArtifact(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let n_fc = fc_years.len();
    let expected = 7 + n_fc + 1;
    if reader.headers()?.len() != expected {
        return Err(PipelineError::Schema(format!(
            "match table {} has {} columns, expected {expected}",
            path.display(),
            reader.headers()?.len()
        )));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let field = |i: usize| row.get(i).unwrap_or("");
        let fc: Vec<Option<f64>> = (0..n_fc).map(|i| parse_opt(field(7 + i))).collect();
        records.push(MatchRecord {
            group: parse_req(field(0), "group")?,
            site_id: field(1).to_string(),
            id_numeric: parse_req(field(2), "id_numeric")?,
            cell: parse_req(field(3), "cell")?,
            treatment: field(4) == "1" || field(4) == "true",
            area_ha: parse_req(field(5), "area_ha")?,
            total_biomass: parse_opt(field(6)),
            fc,
            sampled_fraction: parse_req(field(7 + n_fc), "sampled_fraction")?,
        });
    }
    Ok(records)
}

/// List existing per-site match files as (site_id, path), sorted by id.
pub fn list_match_files(matches_dir: &Path) -> Result<Vec<(String, PathBuf)>, PipelineError> {
    let mut files = Vec::new();
    if !matches_dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(matches_dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some(stem) = name
            .strip_prefix("matches_")
            .and_then(|s| s.strip_suffix(".csv"))
        {
            files.push((stem.to_string(), path.clone()));
        }
    }
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Terminal results
// ---------------------------------------------------------------------------

/// Per-site per-year avoided quantities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteYearResult {
    pub site_id: String,
    pub site_name: String,
    pub year: i32,
    pub forest_loss_avoided_ha: f64,
    pub emissions_avoided_mgco2e: f64,
    pub n_matched_pixels: usize,
    pub sampled_fraction: f64,
}

/// Per-site totals across years.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteTotalResult {
    pub site_id: String,
    pub site_name: String,
    pub forest_loss_avoided_ha: f64,
    pub emissions_avoided_mgco2e: f64,
    pub area_ha: f64,
    pub n_matched_pixels: usize,
    pub sampled_fraction: f64,
    pub first_year: i32,
    pub last_year: i32,
    pub n_years: usize,
}

/// One pixel-year of the matched trajectories, for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PixelLevelResult {
    pub site_id: String,
    pub group: u64,
    pub cell: u64,
    pub treatment: bool,
    pub year: i32,
    pub forest_ha: f64,
    pub forest_change_ha: f64,
    pub emissions_mgco2e: f64,
}

/// Year range observed across all results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct YearRange {
    pub min: i32,
    pub max: i32,
}

/// Global summary: the terminal JSON artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultsSummary {
    pub task_id: Option<String>,
    pub n_sites: usize,
    pub total_emissions_avoided_mgco2e: f64,
    pub total_forest_loss_avoided_ha: f64,
    pub total_area_ha: f64,
    pub year_range: YearRange,
}

pub fn write_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), PipelineError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_csv_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MissingArtifact(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

pub fn write_summary(path: &Path, summary: &ResultsSummary) -> Result<(), PipelineError> {
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}
