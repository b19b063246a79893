//! End-to-end pipeline integration test over locally generated GeoTIFFs.
//!
//! Builds a small synthetic world (one square site on a 20x20 grid with
//! uniform strata and a known forest-cover drop), runs extraction,
//! matching, and summarization against real files in a temp directory,
//! and checks the numeric results and the resumability guarantees.

use carbonmatch::artifacts::{self, ArtifactPaths};
use carbonmatch::config::AnalysisConfig;
use carbonmatch::extract::run_extraction;
use carbonmatch::matching::{run_matching, MatchOutcome, WorkUnit};
use carbonmatch::raster::CovariateStack;
use carbonmatch::report::PipelineContext;
use carbonmatch::summarize::run_summarization;
use carbonmatch::PipelineError;
use std::path::Path;

const WIDTH: u32 = 20;
const HEIGHT: u32 = 20;
const WEST: f64 = 10.0;
const NORTH: f64 = 2.0;
const PIXEL: f64 = 0.1;

// Site square in degrees; covers a 5x5 block of cell centers.
const SITE_W: f64 = 10.5;
const SITE_E: f64 = 11.0;
const SITE_S: f64 = 0.9;
const SITE_N: f64 = 1.4;

/// Write a minimal little-endian classic TIFF: single band, one strip,
/// uncompressed f64 samples, with pixel-scale/tiepoint georeferencing.
fn write_f64_geotiff(path: &Path, values: &[f64]) {
    assert_eq!(values.len(), (WIDTH * HEIGHT) as usize);
    let data_offset: u32 = 8;
    let data_len: u32 = WIDTH * HEIGHT * 8;
    let scale_offset = data_offset + data_len;
    let tiepoint_offset = scale_offset + 24;
    let ifd_offset = tiepoint_offset + 48;

    let mut buf: Vec<u8> = Vec::new();
    buf.extend_from_slice(b"II");
    buf.extend_from_slice(&42u16.to_le_bytes());
    buf.extend_from_slice(&ifd_offset.to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    for v in [PIXEL, PIXEL, 0.0] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    for v in [0.0, 0.0, 0.0, WEST, NORTH, 0.0] {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    // IFD entries in ascending tag order: width, height, bits, compression,
    // strip offset, samples/pixel, rows/strip, strip bytes, sample format,
    // then the GeoTIFF scale and tiepoint.
    let entries: [(u16, u16, u32, u32); 11] = [
        (256, 4, 1, WIDTH),
        (257, 4, 1, HEIGHT),
        (258, 3, 1, 64),
        (259, 3, 1, 1),
        (273, 4, 1, data_offset),
        (277, 3, 1, 1),
        (278, 4, 1, HEIGHT),
        (279, 4, 1, data_len),
        (339, 3, 1, 3),
        (33550, 12, 3, scale_offset),
        (33922, 12, 6, tiepoint_offset),
    ];
    buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (tag, field_type, count, value) in entries {
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(&field_type.to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf.extend_from_slice(&0u32.to_le_bytes());
    std::fs::write(path, buf).unwrap();
}

fn in_site(lon: f64, lat: f64) -> bool {
    lon > SITE_W && lon < SITE_E && lat > SITE_S && lat < SITE_N
}

/// Generate one layer from a function of the cell-center coordinates.
fn layer(f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    let mut values = Vec::with_capacity((WIDTH * HEIGHT) as usize);
    for row in 0..HEIGHT {
        for col in 0..WIDTH {
            let lon = WEST + (col as f64 + 0.5) * PIXEL;
            let lat = NORTH - (row as f64 + 0.5) * PIXEL;
            values.push(f(lon, lat));
        }
    }
    values
}

fn write_world(layers_dir: &Path) {
    std::fs::create_dir_all(layers_dir).unwrap();
    write_f64_geotiff(&layers_dir.join("region.tif"), &layer(|_, _| 1.0));
    write_f64_geotiff(&layers_dir.join("total_biomass.tif"), &layer(|_, _| 100.0));
    write_f64_geotiff(
        &layers_dir.join("elev.tif"),
        &layer(|lon, _| (lon - WEST) * 1000.0),
    );
    write_f64_geotiff(&layers_dir.join("fc_2000.tif"), &layer(|_, _| 0.8));
    // Protected pixels lose more cover than their surroundings in this
    // world, so avoided quantities come out negative.
    write_f64_geotiff(
        &layers_dir.join("fc_2001.tif"),
        &layer(|lon, lat| if in_site(lon, lat) { 0.6 } else { 0.75 }),
    );
}

fn write_sites_file(path: &Path) {
    let geojson = format!(
        r#"{{"type": "FeatureCollection", "features": [{{
            "type": "Feature",
            "properties": {{"site_id": "alpha", "site_name": "Alpha Reserve",
                            "start_date": "2001-01-01"}},
            "geometry": {{"type": "Polygon", "coordinates": [[
                [{SITE_W}, {SITE_S}], [{SITE_E}, {SITE_S}], [{SITE_E}, {SITE_N}],
                [{SITE_W}, {SITE_N}], [{SITE_W}, {SITE_S}]
            ]]}}
        }}]}}"#
    );
    std::fs::write(path, geojson).unwrap();
}

fn config(data_dir: &Path) -> AnalysisConfig {
    serde_json::from_str(&format!(
        r#"{{
            "task_id": "integration-1",
            "data_dir": {:?},
            "gcs_bucket": "unused",
            "gcs_prefix": "unused",
            "covariates": ["elev"],
            "exact_match_vars": ["region"],
            "fc_years": [2000, 2001]
        }}"#,
        data_dir
    ))
    .unwrap()
}

struct World {
    _dir: tempfile::TempDir,
    ctx: PipelineContext,
    stack: CovariateStack,
    paths: ArtifactPaths,
}

fn build_world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let layers_dir = dir.path().join("layers");
    write_world(&layers_dir);

    let config = config(dir.path());
    let paths = ArtifactPaths::new(&config);
    paths.ensure_dirs().unwrap();
    write_sites_file(&config.sites_file());

    let stack = CovariateStack::open_dir(&config, &layers_dir).unwrap();
    World {
        _dir: dir,
        ctx: PipelineContext::silent(config),
        stack,
        paths,
    }
}

#[test]
fn full_pipeline_produces_consistent_results() {
    let world = build_world();

    // --- extraction ---
    let summary = run_extraction(&world.ctx, &world.stack).unwrap();
    assert_eq!(summary.n_sites, 1);
    // 5x5 block of cell centers inside the square
    assert_eq!(summary.n_treatment_cells, 25);
    assert!(summary.n_pixels > 25, "expected a control ring, got {}", summary.n_pixels);

    let key = artifacts::read_treatment_cell_key(&world.paths.treatment_cell_key()).unwrap();
    assert_eq!(key.len(), 25);
    assert!(key.iter().all(|c| c.region == 1.0));

    // --- matching ---
    let outcomes = run_matching(&world.ctx, &WorkUnit::All).unwrap();
    let pairs = match outcomes.as_slice() {
        [(id, MatchOutcome::Written { pairs })] if id == "alpha" => *pairs,
        other => panic!("unexpected outcomes {other:?}"),
    };
    // 25 treatments against the 20-cell control ring: every control used
    assert_eq!(pairs, 20);

    let records =
        artifacts::read_match_table(&world.paths.matches_for("alpha"), &[2000, 2001]).unwrap();
    assert_eq!(records.len(), 40);
    assert!(records.iter().all(|r| (r.sampled_fraction - 1.0).abs() < 1e-12));
    // every pair is one treatment and one control sharing the group key
    for pair in records.chunks(2) {
        assert_eq!(pair[0].group, pair[1].group);
        assert!(pair[0].treatment && !pair[1].treatment);
    }

    // --- idempotence and determinism ---
    let bytes = std::fs::read(world.paths.matches_for("alpha")).unwrap();
    let again = run_matching(&world.ctx, &WorkUnit::All).unwrap();
    assert_eq!(again[0].1, MatchOutcome::AlreadyComplete);
    assert_eq!(std::fs::read(world.paths.matches_for("alpha")).unwrap(), bytes);

    std::fs::remove_file(world.paths.matches_for("alpha")).unwrap();
    let rerun = run_matching(&world.ctx, &WorkUnit::Site("alpha".into())).unwrap();
    assert_eq!(rerun[0].1, MatchOutcome::Written { pairs: 20 });
    assert_eq!(std::fs::read(world.paths.matches_for("alpha")).unwrap(), bytes);

    // --- summarization ---
    let results = run_summarization(&world.ctx).unwrap();
    assert_eq!(results.n_sites, 1);
    assert_eq!(results.task_id.as_deref(), Some("integration-1"));
    assert_eq!((results.year_range.min, results.year_range.max), (2001, 2001));

    // Per pair: treatment emits 100 x 0.2 x 0.5 x 3.67 = 36.7 MgCO2e, the
    // control 9.175, so avoided = -27.525; emissions are area-independent.
    let expected = 20.0 * (9.175 - 36.7);
    assert!(
        (results.total_emissions_avoided_mgco2e - expected).abs() < 1e-6,
        "got {}, expected {expected}",
        results.total_emissions_avoided_mgco2e
    );
    assert!(results.total_forest_loss_avoided_ha < 0.0);

    // Summary totals equal the per-site-total column sums.
    let totals: Vec<carbonmatch::artifacts::SiteTotalResult> =
        artifacts::read_csv_rows(&world.paths.results_by_site_total()).unwrap();
    assert_eq!(totals.len(), 1);
    assert!(
        (totals[0].emissions_avoided_mgco2e - results.total_emissions_avoided_mgco2e).abs()
            < 1e-9
    );
    assert_eq!(totals[0].n_matched_pixels, 20);

    let years: Vec<carbonmatch::artifacts::SiteYearResult> =
        artifacts::read_csv_rows(&world.paths.results_by_site_year()).unwrap();
    assert_eq!(years.len(), 1);
    assert_eq!(years[0].year, 2001);

    let pixel_rows: Vec<carbonmatch::artifacts::PixelLevelResult> =
        artifacts::read_csv_rows(&world.paths.results_pixel_level()).unwrap();
    // 40 matched pixels x 1 emitted year
    assert_eq!(pixel_rows.len(), 40);
}

#[test]
fn match_array_index_addresses_one_site() {
    let world = build_world();
    run_extraction(&world.ctx, &world.stack).unwrap();

    let outcomes = run_matching(&world.ctx, &WorkUnit::ArrayIndex(0)).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, "alpha");
    assert!(matches!(outcomes[0].1, MatchOutcome::Written { .. }));

    let err = run_matching(&world.ctx, &WorkUnit::ArrayIndex(1)).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}

#[test]
fn matching_without_extraction_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let ctx = PipelineContext::silent(config);
    let err = run_matching(&ctx, &WorkUnit::All).unwrap_err();
    assert!(matches!(err, PipelineError::MissingArtifact(_)));
}

#[test]
fn summarization_without_matches_is_fatal() {
    let world = build_world();
    run_extraction(&world.ctx, &world.stack).unwrap();
    let err = run_summarization(&world.ctx).unwrap_err();
    assert!(matches!(err, PipelineError::DataSufficiency(_)));
}
