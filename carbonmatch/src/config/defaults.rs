//! Default values for analysis configuration.
//!
//! These match the defaults the original analysis scripts applied when a
//! tunable was absent from the task config.

/// Treatment pixels per stratum are capped at this count; beyond it the
/// engine samples without replacement.
pub const DEFAULT_MAX_TREATMENT_PIXELS: usize = 1000;

/// Control pool cap, expressed as a multiple of the (sampled) treatment
/// count in the same stratum.
pub const DEFAULT_CONTROL_MULTIPLIER: usize = 50;

/// Sites smaller than this are dropped before extraction.
pub const DEFAULT_MIN_SITE_AREA_HA: f64 = 100.0;

/// Below this many treatment pixels in a stratum, the propensity model is
/// skipped in favor of a raw covariate distance.
pub const DEFAULT_MIN_GLM_TREATMENT_PIXELS: usize = 15;

/// Seed for the subsampling RNG. Fixed so re-runs are deterministic.
pub const DEFAULT_SEED: u64 = 42;

/// Outward buffer around each site, in degrees, defining the control
/// candidate region (~10 km at the equator).
pub const DEFAULT_BUFFER_DEGREES: f64 = 0.1;

/// Exact-match stratification variables.
pub fn default_exact_match_vars() -> Vec<String> {
    vec!["region".into(), "ecoregion".into(), "pa".into()]
}

/// Forest-cover years available from the covariate exports.
pub fn default_fc_years() -> Vec<i32> {
    (2000..=2023).collect()
}

/// Sentinel end year for sites with no end date.
pub const OPEN_ENDED_YEAR: i32 = 9999;

/// Sites established in or after this year get a pre-intervention
/// deforestation-rate covariate added to the matching model.
pub const DEFORESTATION_RATE_THRESHOLD_YEAR: i32 = 2005;

/// Years of forest-cover history used for the pre-intervention
/// deforestation rate.
pub const DEFORESTATION_RATE_LOOKBACK_YEARS: i32 = 5;

/// Minimum coverage fraction for a cell to count as inside the buffered
/// analysis region. Effectively-complete coverage avoids boundary-pixel
/// contamination.
pub const MIN_COVERAGE_FRACTION: f64 = 0.99;
