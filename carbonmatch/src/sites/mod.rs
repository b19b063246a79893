//! Conservation site loading and preprocessing.
//!
//! Sites arrive as a GeoJSON FeatureCollection of polygons with
//! `site_id`, `site_name`, and `start_date` properties. Processing
//! derives areas on the ellipsoid, intervention year ranges, and the
//! raster-compatible `id_numeric` identifiers, then filters out sites
//! below the configured minimum area.

use crate::config::defaults::OPEN_ENDED_YEAR;
use crate::error::PipelineError;
use chrono::{Datelike, NaiveDate};
use geo::{BoundingRect, GeodesicArea, MultiPolygon};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// One conservation site with derived analysis fields.
#[derive(Debug, Clone)]
pub struct Site {
    pub site_id: String,
    pub site_name: String,
    pub geometry: MultiPolygon<f64>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub area_ha: f64,
    pub start_year: i32,
    pub end_year: i32,
    /// Raster-compatible integer id, assigned in `site_id` order.
    pub id_numeric: u32,
}

impl Site {
    /// (west, south, east, north) bounds of the site geometry.
    pub fn bounds(&self) -> Result<(f64, f64, f64, f64), PipelineError> {
        let rect = self.geometry.bounding_rect().ok_or_else(|| {
            PipelineError::Schema(format!("site '{}' has empty geometry", self.site_id))
        })?;
        Ok((rect.min().x, rect.min().y, rect.max().x, rect.max().y))
    }

    /// Metadata row persisted to `sites_processed.json`.
    pub fn meta(&self) -> SiteMeta {
        SiteMeta {
            site_id: self.site_id.clone(),
            site_name: self.site_name.clone(),
            start_date: self.start_date.to_string(),
            end_date: self.end_date.map(|d| d.to_string()),
            start_year: self.start_year,
            end_year: self.end_year,
            area_ha: self.area_ha,
            id_numeric: self.id_numeric,
        }
    }
}

/// Geometry-free site record consumed by matching and summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteMeta {
    pub site_id: String,
    pub site_name: String,
    pub start_date: String,
    pub end_date: Option<String>,
    pub start_year: i32,
    pub end_year: i32,
    pub area_ha: f64,
    pub id_numeric: u32,
}

/// Load raw sites from a GeoJSON file. No filtering or id assignment yet.
pub fn load_sites(path: &Path) -> Result<Vec<Site>, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Configuration(format!("cannot read sites file {}: {e}", path.display()))
    })?;
    let geojson: geojson::GeoJson = text.parse().map_err(|e| {
        PipelineError::Configuration(format!("sites file is not valid GeoJSON: {e}"))
    })?;
    let collection = match geojson {
        geojson::GeoJson::FeatureCollection(fc) => fc,
        _ => {
            return Err(PipelineError::Configuration(
                "sites file must be a GeoJSON FeatureCollection".into(),
            ))
        }
    };

    let mut sites = Vec::new();
    for (i, feature) in collection.features.into_iter().enumerate() {
        let site = feature_to_site(feature, i)?;
        sites.push(site);
    }
    info!(count = sites.len(), path = %path.display(), "loaded sites");
    Ok(sites)
}

fn feature_to_site(feature: geojson::Feature, index: usize) -> Result<Site, PipelineError> {
    let prop = |name: &str| -> Result<String, PipelineError> {
        feature
            .properties
            .as_ref()
            .and_then(|p| p.get(name))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| {
                PipelineError::Schema(format!("site feature {index} is missing '{name}'"))
            })
    };

    let site_id = prop("site_id")?;
    let site_name = prop("site_name")?;
    let start_date = parse_date(&prop("start_date")?, &site_id)?;
    let end_date = match feature
        .properties
        .as_ref()
        .and_then(|p| p.get("end_date"))
        .and_then(|v| v.as_str())
    {
        Some(s) if !s.is_empty() => Some(parse_date(s, &site_id)?),
        _ => None,
    };

    let gj_geometry = feature.geometry.ok_or_else(|| {
        PipelineError::Schema(format!("site '{site_id}' has no geometry"))
    })?;
    let geometry: geo::Geometry<f64> = gj_geometry.try_into().map_err(|e| {
        PipelineError::Schema(format!("site '{site_id}' geometry is invalid: {e}"))
    })?;
    let geometry = match geometry {
        geo::Geometry::Polygon(p) => MultiPolygon(vec![p]),
        geo::Geometry::MultiPolygon(mp) => mp,
        _ => {
            return Err(PipelineError::Schema(format!(
                "site '{site_id}' geometry must be polygonal"
            )))
        }
    };

    // Inputs are expected in a geographic CRS; coordinates outside valid
    // degree ranges indicate a projected file we cannot interpret.
    if let Some(rect) = geometry.bounding_rect() {
        if rect.min().x < -180.0 || rect.max().x > 180.0 || rect.min().y < -90.0
            || rect.max().y > 90.0
        {
            return Err(PipelineError::Schema(format!(
                "site '{site_id}' coordinates are outside EPSG:4326 degree ranges; \
                 reproject the sites file to EPSG:4326"
            )));
        }
    }

    let area_ha = geometry.geodesic_area_unsigned() / 10_000.0;
    let start_year = start_date.year();
    let end_year = end_date.map(|d| d.year()).unwrap_or(OPEN_ENDED_YEAR);

    Ok(Site {
        site_id,
        site_name,
        geometry,
        start_date,
        end_date,
        area_ha,
        start_year,
        end_year,
        id_numeric: 0, // assigned by process_sites
    })
}

fn parse_date(text: &str, site_id: &str) -> Result<NaiveDate, PipelineError> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| {
        PipelineError::Schema(format!("site '{site_id}' has invalid date '{text}': {e}"))
    })
}

/// Sort by `site_id`, drop sites below the minimum area, and assign
/// `id_numeric` in sorted order.
///
/// # Errors
///
/// `DataSufficiency` when no site survives the area filter.
pub fn process_sites(
    mut sites: Vec<Site>,
    min_site_area_ha: f64,
) -> Result<Vec<Site>, PipelineError> {
    sites.sort_by(|a, b| a.site_id.cmp(&b.site_id));

    let before = sites.len();
    sites.retain(|s| {
        if s.area_ha < min_site_area_ha {
            warn!(
                site_id = %s.site_id,
                area_ha = s.area_ha,
                min_site_area_ha,
                "dropping site below minimum area"
            );
            false
        } else {
            true
        }
    });

    if sites.is_empty() {
        return Err(PipelineError::DataSufficiency(format!(
            "no sites with area >= {min_site_area_ha} ha remain ({before} read)"
        )));
    }

    for (i, site) in sites.iter_mut().enumerate() {
        site.id_numeric = (i + 1) as u32;
    }

    info!(
        kept = sites.len(),
        dropped = before - sites.len(),
        "processed sites"
    );
    Ok(sites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn square_feature(site_id: &str, lon0: f64, lat0: f64, size_deg: f64, extra: &str) -> String {
        format!(
            r#"{{
                "type": "Feature",
                "properties": {{"site_id": "{site_id}", "site_name": "Site {site_id}",
                                "start_date": "2010-06-01"{extra}}},
                "geometry": {{"type": "Polygon", "coordinates": [[
                    [{lon0}, {lat0}], [{lon1}, {lat0}], [{lon1}, {lat1}],
                    [{lon0}, {lat1}], [{lon0}, {lat0}]
                ]]}}
            }}"#,
            lon1 = lon0 + size_deg,
            lat1 = lat0 + size_deg,
        )
    }

    fn write_collection(features: &[String]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"type": "FeatureCollection", "features": [{}]}}"#,
            features.join(",")
        )
        .unwrap();
        f
    }

    #[test]
    fn loads_square_site_with_plausible_area() {
        let f = write_collection(&[square_feature("alpha", 10.0, 0.0, 0.1, "")]);
        let sites = load_sites(f.path()).unwrap();
        assert_eq!(sites.len(), 1);
        let s = &sites[0];
        assert_eq!(s.site_id, "alpha");
        assert_eq!(s.start_year, 2010);
        assert_eq!(s.end_year, OPEN_ENDED_YEAR);
        // 0.1 x 0.1 degrees at the equator is ~11.1 x 11.1 km = ~12300 ha
        assert!((s.area_ha - 12_300.0).abs() < 500.0, "{}", s.area_ha);
    }

    #[test]
    fn end_date_bounds_end_year() {
        let f = write_collection(&[square_feature(
            "alpha",
            10.0,
            0.0,
            0.1,
            r#", "end_date": "2018-12-31""#,
        )]);
        let sites = load_sites(f.path()).unwrap();
        assert_eq!(sites[0].end_year, 2018);
    }

    #[test]
    fn missing_site_name_is_schema_error() {
        let bad = r#"{"type": "Feature",
            "properties": {"site_id": "alpha", "start_date": "2010-01-01"},
            "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}}"#;
        let f = write_collection(&[bad.to_string()]);
        let err = load_sites(f.path()).unwrap_err();
        assert!(err.to_string().contains("site_name"), "{err}");
    }

    #[test]
    fn missing_site_id_is_schema_error() {
        let bad = r#"{"type": "Feature",
            "properties": {"start_date": "2010-01-01"},
            "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}}"#;
        let f = write_collection(&[bad.to_string()]);
        let err = load_sites(f.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Schema(_)));
    }

    #[test]
    fn projected_coordinates_rejected() {
        let feature = square_feature("alpha", 500_000.0, 4_000_000.0, 1000.0, "");
        let f = write_collection(&[feature]);
        let err = load_sites(f.path()).unwrap_err();
        assert!(err.to_string().contains("EPSG:4326"));
    }

    #[test]
    fn process_sites_filters_and_numbers() {
        let f = write_collection(&[
            square_feature("beta", 10.0, 0.0, 0.1, ""),
            square_feature("alpha", 12.0, 0.0, 0.1, ""),
            square_feature("tiny", 14.0, 0.0, 0.001, ""), // ~1.2 ha
        ]);
        let sites = load_sites(f.path()).unwrap();
        let processed = process_sites(sites, 100.0).unwrap();
        assert_eq!(processed.len(), 2);
        assert_eq!(processed[0].site_id, "alpha");
        assert_eq!(processed[0].id_numeric, 1);
        assert_eq!(processed[1].site_id, "beta");
        assert_eq!(processed[1].id_numeric, 2);
    }

    #[test]
    fn all_sites_filtered_is_data_sufficiency_error() {
        let f = write_collection(&[square_feature("tiny", 14.0, 0.0, 0.001, "")]);
        let sites = load_sites(f.path()).unwrap();
        let err = process_sites(sites, 100.0).unwrap_err();
        assert!(matches!(err, PipelineError::DataSufficiency(_)));
    }
}
