//! Raster layer access.
//!
//! Covariate layers are individually addressable Cloud-Optimized GeoTIFFs
//! at `{bucket}/{prefix}/{name}.tif`, read through HTTP range requests.
//! The [`RasterLayer`] trait is the seam between the extraction engine and
//! the storage format, so tests can substitute locally generated files.

mod fetch;
mod geotiff;
mod grid;
mod stack;

pub use fetch::{FileRangeFetcher, HttpRangeFetcher, RangeFetch};
pub use geotiff::GeoTiffLayer;
pub use grid::{ellipsoidal_cell_area_ha, GridInfo, Window};
pub use stack::CovariateStack;

use crate::error::PipelineError;

/// One read-only raster layer on a shared geographic grid.
pub trait RasterLayer: Send + Sync {
    /// Layer name (the covariate name, e.g. `region` or `fc_2015`).
    fn name(&self) -> &str;

    /// The layer's grid georeferencing.
    fn grid(&self) -> &GridInfo;

    /// Read a pixel window in row-major order. `None` marks nodata.
    fn read_window(&self, window: &Window) -> Result<Vec<Option<f64>>, PipelineError>;
}
