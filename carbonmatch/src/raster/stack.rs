//! The covariate stack: every raster layer one pipeline run reads.
//!
//! Layers are opened lazily via range requests and validated to share a
//! single spatial grid. The `region` layer is mandatory because matching
//! depends on it for exact-match stratification and the treatment-cell key
//! is sampled from it.

use super::fetch::{FileRangeFetcher, HttpRangeFetcher};
use super::geotiff::GeoTiffLayer;
use super::grid::GridInfo;
use super::RasterLayer;
use crate::config::AnalysisConfig;
use crate::error::PipelineError;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// An ordered, read-only collection of named raster layers sharing one grid.
pub struct CovariateStack {
    layers: BTreeMap<String, Box<dyn RasterLayer>>,
    order: Vec<String>,
    grid: GridInfo,
}

impl CovariateStack {
    /// Open all configured layers over HTTP range requests.
    pub fn open_http(config: &AnalysisConfig) -> Result<Self, PipelineError> {
        let client = HttpRangeFetcher::build_client()?;
        Self::open_with(config, |name| {
            let url = config.layer_url(name);
            let fetcher = HttpRangeFetcher::new(client.clone(), url);
            let layer = GeoTiffLayer::open(fetcher, name)?;
            Ok(Box::new(layer) as Box<dyn RasterLayer>)
        })
    }

    /// Open all configured layers from `{dir}/{name}.tif` on local disk.
    pub fn open_dir(config: &AnalysisConfig, dir: &Path) -> Result<Self, PipelineError> {
        Self::open_with(config, |name| {
            let fetcher = FileRangeFetcher::open(&dir.join(format!("{name}.tif")))?;
            let layer = GeoTiffLayer::open(fetcher, name)?;
            Ok(Box::new(layer) as Box<dyn RasterLayer>)
        })
    }

    /// Build a stack from pre-constructed layers. The seam for tests.
    pub fn from_layers(layers: Vec<Box<dyn RasterLayer>>) -> Result<Self, PipelineError> {
        let order: Vec<String> = layers.iter().map(|l| l.name().to_string()).collect();
        let mut map = BTreeMap::new();
        for layer in layers {
            map.insert(layer.name().to_string(), layer);
        }
        Self::validate(map, order)
    }

    fn open_with(
        config: &AnalysisConfig,
        mut open: impl FnMut(&str) -> Result<Box<dyn RasterLayer>, PipelineError>,
    ) -> Result<Self, PipelineError> {
        let order = config.all_layer_names();
        let mut layers = BTreeMap::new();
        for name in &order {
            let layer = open(name)?;
            layers.insert(name.clone(), layer);
        }
        let stack = Self::validate(layers, order)?;
        info!(
            layers = stack.order.len(),
            width = stack.grid.width,
            height = stack.grid.height,
            "covariate stack opened"
        );
        Ok(stack)
    }

    fn validate(
        layers: BTreeMap<String, Box<dyn RasterLayer>>,
        order: Vec<String>,
    ) -> Result<Self, PipelineError> {
        let region = layers.get("region").ok_or_else(|| {
            PipelineError::Schema(
                "required layer 'region' is missing from the covariate exports".into(),
            )
        })?;
        let grid = region.grid().clone();

        for (name, layer) in &layers {
            if !grid.same_grid(layer.grid()) {
                return Err(PipelineError::Schema(format!(
                    "layer '{name}' does not share the common grid \
                     ({}x{} vs {}x{})",
                    layer.grid().width,
                    layer.grid().height,
                    grid.width,
                    grid.height
                )));
            }
        }

        Ok(Self {
            layers,
            order,
            grid,
        })
    }

    /// The shared grid of all layers.
    pub fn grid(&self) -> &GridInfo {
        &self.grid
    }

    /// Look up one layer by name.
    pub fn layer(&self, name: &str) -> Result<&dyn RasterLayer, PipelineError> {
        self.layers
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| PipelineError::Schema(format!("layer '{name}' not in stack")))
    }

    /// Layer names in configured (column) order.
    pub fn layer_names(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Window;

    struct FakeLayer {
        name: String,
        grid: GridInfo,
    }

    impl RasterLayer for FakeLayer {
        fn name(&self) -> &str {
            &self.name
        }
        fn grid(&self) -> &GridInfo {
            &self.grid
        }
        fn read_window(&self, window: &Window) -> Result<Vec<Option<f64>>, PipelineError> {
            Ok(vec![None; window.len()])
        }
    }

    fn grid(width: u32) -> GridInfo {
        GridInfo {
            width,
            height: 10,
            origin_x: 0.0,
            origin_y: 10.0,
            dx: 0.1,
            dy: -0.1,
            nodata: None,
        }
    }

    fn layer(name: &str, width: u32) -> Box<dyn RasterLayer> {
        Box::new(FakeLayer {
            name: name.into(),
            grid: grid(width),
        })
    }

    #[test]
    fn missing_region_is_schema_error() {
        let err = CovariateStack::from_layers(vec![layer("elev", 10)])
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Schema(_)));
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn mismatched_grid_is_schema_error() {
        let err = CovariateStack::from_layers(vec![layer("region", 10), layer("elev", 20)])
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Schema(_)));
        assert!(err.to_string().contains("elev"));
    }

    #[test]
    fn matching_grids_accepted() {
        let stack =
            CovariateStack::from_layers(vec![layer("region", 10), layer("elev", 10)]).unwrap();
        assert_eq!(stack.grid().width, 10);
        assert!(stack.layer("region").is_ok());
        assert!(stack.layer("slope").is_err());
    }
}
