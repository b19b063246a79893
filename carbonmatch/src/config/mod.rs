//! Analysis configuration.
//!
//! The pipeline is driven by a single JSON config document written by the
//! task submitter. Required fields locate the sites file and the raster
//! layers; optional tunables fall back to the defaults in [`defaults`].
//!
//! Derived paths (`input_dir`, `output_dir`, `matches_dir`) live under
//! `data_dir` and can be re-rooted with a `--data-dir` override without
//! editing the config file.

pub mod defaults;

use crate::error::PipelineError;
use defaults::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Identifier echoed into the results summary.
    #[serde(default)]
    pub task_id: Option<String>,

    /// Working directory holding `input/`, `output/`, and `matches/`.
    pub data_dir: PathBuf,

    /// Sites vector file. Defaults to `{data_dir}/input/sites.geojson`.
    #[serde(default)]
    pub sites_file: Option<PathBuf>,

    /// Bucket holding the covariate rasters.
    pub gcs_bucket: String,

    /// Key prefix under the bucket.
    pub gcs_prefix: String,

    /// Ordered list of matching covariate layer names.
    pub covariates: Vec<String>,

    /// Exact-match stratification variables.
    #[serde(default = "default_exact_match_vars")]
    pub exact_match_vars: Vec<String>,

    /// Forest-cover years available as `fc_{year}` layers.
    #[serde(default = "default_fc_years")]
    pub fc_years: Vec<i32>,

    /// Restrict matching to a single site.
    #[serde(default)]
    pub site_id: Option<String>,

    #[serde(default = "d_max_treatment_pixels")]
    pub max_treatment_pixels: usize,

    #[serde(default = "d_control_multiplier")]
    pub control_multiplier: usize,

    #[serde(default = "d_min_site_area_ha")]
    pub min_site_area_ha: f64,

    #[serde(default = "d_min_glm_treatment_pixels")]
    pub min_glm_treatment_pixels: usize,

    /// RNG seed for treatment/control subsampling.
    #[serde(default = "d_seed")]
    pub seed: u64,

    /// Outward site buffer in degrees for the control candidate region.
    #[serde(default = "d_buffer_degrees")]
    pub buffer_degrees: f64,
}

fn d_max_treatment_pixels() -> usize {
    DEFAULT_MAX_TREATMENT_PIXELS
}
fn d_control_multiplier() -> usize {
    DEFAULT_CONTROL_MULTIPLIER
}
fn d_min_site_area_ha() -> f64 {
    DEFAULT_MIN_SITE_AREA_HA
}
fn d_min_glm_treatment_pixels() -> usize {
    DEFAULT_MIN_GLM_TREATMENT_PIXELS
}
fn d_seed() -> u64 {
    DEFAULT_SEED
}
fn d_buffer_degrees() -> f64 {
    DEFAULT_BUFFER_DEGREES
}

impl AnalysisConfig {
    /// Load and validate a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!(
                "cannot read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: AnalysisConfig = serde_json::from_str(&text).map_err(|e| {
            PipelineError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field combinations that serde cannot express.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.covariates.is_empty() {
            return Err(PipelineError::Configuration(
                "covariates list is empty".into(),
            ));
        }
        if self.fc_years.is_empty() {
            return Err(PipelineError::Configuration("fc_years is empty".into()));
        }
        let mut sorted = self.fc_years.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted != self.fc_years {
            return Err(PipelineError::Configuration(
                "fc_years must be sorted and unique".into(),
            ));
        }
        if self.exact_match_vars.is_empty() {
            return Err(PipelineError::Configuration(
                "exact_match_vars is empty".into(),
            ));
        }
        if !self.exact_match_vars.iter().any(|v| v == "region") {
            return Err(PipelineError::Configuration(
                "exact_match_vars must include 'region'".into(),
            ));
        }
        if self.control_multiplier == 0 || self.max_treatment_pixels == 0 {
            return Err(PipelineError::Configuration(
                "max_treatment_pixels and control_multiplier must be positive".into(),
            ));
        }
        if self.buffer_degrees <= 0.0 {
            return Err(PipelineError::Configuration(
                "buffer_degrees must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Re-root all derived paths under a new data directory.
    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = data_dir;
        self
    }

    /// Directory for extraction artifacts.
    pub fn input_dir(&self) -> PathBuf {
        self.data_dir.join("input")
    }

    /// Directory for terminal results.
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    /// Directory for per-site match files.
    pub fn matches_dir(&self) -> PathBuf {
        self.data_dir.join("matches")
    }

    /// Sites vector file, explicit or the conventional location.
    pub fn sites_file(&self) -> PathBuf {
        self.sites_file
            .clone()
            .unwrap_or_else(|| self.input_dir().join("sites.geojson"))
    }

    /// URL of one covariate raster under the configured bucket/prefix.
    pub fn layer_url(&self, name: &str) -> String {
        format!(
            "https://storage.googleapis.com/{}/{}/{}.tif",
            self.gcs_bucket,
            self.gcs_prefix.trim_matches('/'),
            name
        )
    }

    /// Every raster layer the extraction engine samples: the exact-match
    /// strata, biomass, the configured covariates, then forest cover by
    /// year. Order is the column order of the pixel table.
    pub fn all_layer_names(&self) -> Vec<String> {
        let mut names = self.exact_match_vars.clone();
        names.push("total_biomass".to_string());
        for c in &self.covariates {
            if !names.contains(c) {
                names.push(c.clone());
            }
        }
        for y in &self.fc_years {
            names.push(fc_layer_name(*y));
        }
        names
    }
}

/// Layer/column name for one forest-cover year.
pub fn fc_layer_name(year: i32) -> String {
    format!("fc_{year}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        r#"{
            "data_dir": "/tmp/ae",
            "gcs_bucket": "covariates-bucket",
            "gcs_prefix": "avoided-emissions/covariates",
            "covariates": ["elev", "slope", "precip"],
            "fc_years": [2000, 2001, 2002]
        }"#
        .to_string()
    }

    #[test]
    fn defaults_applied_for_optional_fields() {
        let config: AnalysisConfig = serde_json::from_str(&minimal_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_treatment_pixels, 1000);
        assert_eq!(config.control_multiplier, 50);
        assert_eq!(config.min_site_area_ha, 100.0);
        assert_eq!(config.min_glm_treatment_pixels, 15);
        assert_eq!(config.seed, 42);
        assert_eq!(
            config.exact_match_vars,
            vec!["region", "ecoregion", "pa"]
        );
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let config: AnalysisConfig = serde_json::from_str(&minimal_json()).unwrap();
        assert_eq!(config.input_dir(), PathBuf::from("/tmp/ae/input"));
        assert_eq!(config.output_dir(), PathBuf::from("/tmp/ae/output"));
        assert_eq!(config.matches_dir(), PathBuf::from("/tmp/ae/matches"));
        assert_eq!(
            config.sites_file(),
            PathBuf::from("/tmp/ae/input/sites.geojson")
        );
    }

    #[test]
    fn data_dir_override_reroots_paths() {
        let config: AnalysisConfig = serde_json::from_str(&minimal_json()).unwrap();
        let config = config.with_data_dir(PathBuf::from("/mnt/scratch"));
        assert_eq!(config.matches_dir(), PathBuf::from("/mnt/scratch/matches"));
    }

    #[test]
    fn layer_url_pattern() {
        let config: AnalysisConfig = serde_json::from_str(&minimal_json()).unwrap();
        assert_eq!(
            config.layer_url("region"),
            "https://storage.googleapis.com/covariates-bucket/avoided-emissions/covariates/region.tif"
        );
    }

    #[test]
    fn empty_covariates_rejected() {
        let mut config: AnalysisConfig = serde_json::from_str(&minimal_json()).unwrap();
        config.covariates.clear();
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn unsorted_fc_years_rejected() {
        let mut config: AnalysisConfig = serde_json::from_str(&minimal_json()).unwrap();
        config.fc_years = vec![2002, 2000, 2001];
        assert!(config.validate().is_err());
    }

    #[test]
    fn all_layer_names_order_and_dedup() {
        let mut config: AnalysisConfig = serde_json::from_str(&minimal_json()).unwrap();
        config.covariates.push("region".into()); // already a stratum
        let names = config.all_layer_names();
        assert_eq!(
            names,
            vec![
                "region",
                "ecoregion",
                "pa",
                "total_biomass",
                "elev",
                "slope",
                "precip",
                "fc_2000",
                "fc_2001",
                "fc_2002"
            ]
        );
    }
}
