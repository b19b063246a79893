//! Covariate extraction engine.
//!
//! Stage 1 of the pipeline. Loads and processes the site polygons, then
//! samples the covariate stack to produce the three artifacts matching
//! consumes: the processed site table, the treatment-cell key, and the
//! combined pixel table for every cell inside each site's buffered
//! analysis region.
//!
//! The stack is read-only; this stage's only side effects are the files
//! it writes under `input/`.

use crate::artifacts::{
    self, ArtifactPaths, PixelRecord, TableSchema, TreatmentCell,
};
use crate::config::defaults::MIN_COVERAGE_FRACTION;
use crate::error::PipelineError;
use crate::matching::model::ModelSpec;
use crate::raster::{CovariateStack, GridInfo};
use crate::report::PipelineContext;
use crate::sites::{load_sites, process_sites, Site};
use geo::{Contains, EuclideanDistance, MultiPolygon, Point};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Counts reported by a completed extraction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub n_sites: usize,
    pub n_treatment_cells: usize,
    pub n_pixels: usize,
}

/// Run the extraction stage end to end.
pub fn run_extraction(
    ctx: &PipelineContext,
    stack: &CovariateStack,
) -> Result<ExtractionSummary, PipelineError> {
    let config = &ctx.config;
    let paths = ArtifactPaths::new(config);
    paths.ensure_dirs()?;

    let sites = process_sites(load_sites(&config.sites_file())?, config.min_site_area_ha)?;
    let grid = stack.grid();
    let schema = TableSchema::from_config(config);

    // Pass 1: treatment-cell key over the region layer, all sites, so that
    // ownership is known before any pixel row is flagged.
    let (key, owners) = build_treatment_key(&sites, stack)?;

    // Pass 2: combined pixel table over every layer, buffered per site.
    let mut pixels: BTreeMap<u64, PixelRecord> = BTreeMap::new();
    for site in &sites {
        sample_site_pixels(site, stack, grid, config, &schema, &owners, &mut pixels)?;
    }
    let records: Vec<PixelRecord> = pixels.into_values().collect();

    let metas: Vec<_> = sites.iter().map(Site::meta).collect();
    artifacts::write_sites_processed(&paths.sites_processed(), &metas)?;
    artifacts::write_site_id_key(&paths.site_id_key(), &metas)?;
    artifacts::write_treatment_cell_key(&paths.treatment_cell_key(), &key)?;
    artifacts::write_pixel_table(&paths.treatments_and_controls(), &schema, &records)?;

    // Base model specification; matching augments it per site when the
    // pre-intervention deforestation rate is computable.
    let spec = ModelSpec::new(config.covariates.clone());
    spec.write(&paths.formula())?;

    let summary = ExtractionSummary {
        n_sites: sites.len(),
        n_treatment_cells: key.len(),
        n_pixels: records.len(),
    };
    info!(
        n_sites = summary.n_sites,
        n_treatment_cells = summary.n_treatment_cells,
        n_pixels = summary.n_pixels,
        "extraction complete"
    );
    Ok(summary)
}

/// Cell ownership: which sites' polygons claim each treatment cell.
type Owners = BTreeMap<u64, Vec<String>>;

fn build_treatment_key(
    sites: &[Site],
    stack: &CovariateStack,
) -> Result<(Vec<TreatmentCell>, Owners), PipelineError> {
    let grid = stack.grid();
    let region = stack.layer("region")?;
    let mut key = Vec::new();
    let mut owners: Owners = BTreeMap::new();

    for site in sites {
        let (west, south, east, north) = site.bounds()?;
        let window = grid.window_for_bounds(west, south, east, north);
        if window.is_empty() {
            warn!(site_id = %site.site_id, "site does not intersect the covariate grid");
            continue;
        }
        let values = region.read_window(&window)?;
        let mut count = 0usize;
        for (i, (row, col)) in window.cells().enumerate() {
            // Only cells with a known region are treatment cells.
            let Some(region_value) = values[i] else {
                continue;
            };
            let (lon, lat) = grid.cell_center(row, col);
            if !site.geometry.contains(&Point::new(lon, lat)) {
                continue;
            }
            let cell = grid.cell_id(row, col);
            key.push(TreatmentCell {
                site_id: site.site_id.clone(),
                cell,
                area_ha: grid.cell_area_ha(row),
                region: region_value,
            });
            owners.entry(cell).or_default().push(site.site_id.clone());
            count += 1;
        }
        debug!(site_id = %site.site_id, cells = count, "treatment cells sampled");
    }

    Ok((key, owners))
}

/// The site whose treatment area exclusively owns `cell`, if any. A cell
/// claimed by two sites is treatment for neither.
fn unique_owner<'a>(owners: &'a Owners, cell: u64) -> Option<&'a str> {
    match owners.get(&cell) {
        Some(list) if list.len() == 1 => Some(list[0].as_str()),
        _ => None,
    }
}

fn sample_site_pixels(
    site: &Site,
    stack: &CovariateStack,
    grid: &GridInfo,
    config: &crate::config::AnalysisConfig,
    schema: &TableSchema,
    owners: &Owners,
    pixels: &mut BTreeMap<u64, PixelRecord>,
) -> Result<(), PipelineError> {
    let buffer = config.buffer_degrees;
    let (west, south, east, north) = buffered_bounds(grid, site.bounds()?, buffer);
    let window = grid.window_for_bounds(west, south, east, north);
    if window.is_empty() {
        return Ok(());
    }

    // One window read per layer, in schema column order.
    let names = stack.layer_names().to_vec();
    let mut columns: BTreeMap<&str, Vec<Option<f64>>> = BTreeMap::new();
    for name in &names {
        columns.insert(name.as_str(), stack.layer(name)?.read_window(&window)?);
    }
    let value = |name: &str, i: usize| -> Option<f64> { columns[name][i] };

    let mut kept = 0usize;
    for (i, (row, col)) in window.cells().enumerate() {
        let cell = grid.cell_id(row, col);
        if pixels.contains_key(&cell) {
            continue; // already sampled from an earlier site's buffer
        }
        if coverage_fraction(grid, row, col, &site.geometry, buffer) < MIN_COVERAGE_FRACTION {
            continue;
        }

        // A cell exclusively owned by one site's treatment area is a
        // treatment pixel for that owner, even when sampled here through a
        // neighboring site's buffer. Contested cells are treatment for
        // neither site and stay out of every control pool via the key.
        let owner = unique_owner(owners, cell);
        let treatment = owner.is_some();
        let site_id = owner
            .map(str::to_string)
            .unwrap_or_else(|| site.site_id.clone());

        let record = PixelRecord {
            cell,
            site_id,
            treatment,
            area_ha: grid.cell_area_ha(row),
            strata: schema
                .exact_match_vars
                .iter()
                .map(|v| value(v, i))
                .collect(),
            total_biomass: value("total_biomass", i),
            covariates: schema.covariates.iter().map(|c| value(c, i)).collect(),
            fc: schema
                .fc_years
                .iter()
                .map(|y| value(&crate::config::fc_layer_name(*y), i))
                .collect(),
        };
        pixels.insert(cell, record);
        kept += 1;
    }

    debug!(site_id = %site.site_id, kept, window = window.len(), "site pixels sampled");
    Ok(())
}

/// Site bounds grown by the buffer plus one cell margin on each axis, so
/// partially covered edge cells are never clipped out of the window.
fn buffered_bounds(
    grid: &GridInfo,
    bounds: (f64, f64, f64, f64),
    buffer: f64,
) -> (f64, f64, f64, f64) {
    let (west, south, east, north) = bounds;
    (
        west - buffer - grid.dx,
        south - buffer - grid.dy.abs(),
        east + buffer + grid.dx,
        north + buffer + grid.dy.abs(),
    )
}

/// Fraction of a cell inside the site's buffered region, estimated on a
/// 5x5 subgrid of the cell. A point is inside when its distance to the
/// site geometry is at most the buffer.
fn coverage_fraction(
    grid: &GridInfo,
    row: u32,
    col: u32,
    geometry: &MultiPolygon<f64>,
    buffer: f64,
) -> f64 {
    const N: u32 = 5;
    let (west, south, east, north) = grid.cell_bounds(row, col);
    let dx = (east - west) / N as f64;
    let dy = (north - south) / N as f64;

    let mut inside = 0u32;
    for i in 0..N {
        for j in 0..N {
            let p = Point::new(
                west + (i as f64 + 0.5) * dx,
                south + (j as f64 + 0.5) * dy,
            );
            if p.euclidean_distance(geometry) <= buffer {
                inside += 1;
            }
        }
    }
    inside as f64 / (N * N) as f64
}
