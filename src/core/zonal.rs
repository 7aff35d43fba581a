use geo::{ChamberlainDuquetteArea, Contains, MultiPolygon, Point};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::core::classifier::FloodMapRaster;
use crate::types::{FloodError, FloodResult, BAND_NODATA};

/// Zonal aggregation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZonalParams {
    /// Pixels are subdivided into an NxN point grid to estimate fractional
    /// overlap with the polygon boundary; pixels straddling the boundary
    /// contribute proportionally rather than all-or-nothing
    pub supersample: usize,
}

impl Default for ZonalParams {
    fn default() -> Self {
        Self { supersample: 4 }
    }
}

/// Per-event zonal metrics with provenance counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZonalMetrics {
    /// People within flooded pixels, density-weighted
    pub flooded_population: f64,
    pub flooded_area_km2: f64,
    /// flooded_area_km2 / polygon_area_km2
    pub flooded_area_norm: f64,
    pub polygon_area_km2: f64,
    /// Pixels inside the polygon with a usable flooded/not-flooded call
    pub valid_pixels: usize,
    /// Pixels inside the polygon
    pub total_pixels: usize,
    /// Mean cloud-clear fraction over valid pixels inside the polygon
    pub clear_fraction: Option<f64>,
    /// True when zero valid pixels: distinguishes "no usable imagery" from
    /// genuinely zero flooding
    pub no_usable_imagery: bool,
}

/// Intersects a classified flood raster with an administrative polygon and a
/// population-density grid.
pub struct ZonalAggregator {
    params: ZonalParams,
}

impl ZonalAggregator {
    pub fn new() -> Self {
        Self {
            params: ZonalParams::default(),
        }
    }

    pub fn with_params(params: ZonalParams) -> Self {
        Self { params }
    }

    /// Geographic polygon area in km^2 (spherical excess on the WGS84
    /// authalic sphere). Invariant per admin unit; computed once and reused
    /// across all events referencing the unit.
    pub fn polygon_area_km2(polygon: &MultiPolygon<f64>) -> f64 {
        polygon
            .0
            .iter()
            .map(|p| p.chamberlain_duquette_unsigned_area())
            .sum::<f64>()
            / 1.0e6
    }

    /// Fraction of a pixel inside the polygon, from a deterministic NxN
    /// point subgrid
    fn coverage_fraction(
        &self,
        grid: &crate::types::GridSpec,
        row: usize,
        col: usize,
        polygon: &MultiPolygon<f64>,
    ) -> f64 {
        let n = self.params.supersample.max(1);
        let t = &grid.transform;
        let x0 = t.top_left_x + col as f64 * t.pixel_width;
        let y0 = t.top_left_y + row as f64 * t.pixel_height;
        let mut inside = 0usize;
        for i in 0..n {
            let y = y0 + (i as f64 + 0.5) / n as f64 * t.pixel_height;
            for j in 0..n {
                let x = x0 + (j as f64 + 0.5) / n as f64 * t.pixel_width;
                if polygon.contains(&Point::new(x, y)) {
                    inside += 1;
                }
            }
        }
        inside as f64 / (n * n) as f64
    }

    /// Aggregate one event's classification raster over its admin polygon.
    ///
    /// `density` is persons/km^2 co-registered with the raster; None means
    /// population data was unavailable, which zeroes flooded_population but
    /// still produces area metrics (the gap is recorded by the caller as a
    /// quality flag).
    pub fn aggregate(
        &self,
        map: &FloodMapRaster,
        polygon: &MultiPolygon<f64>,
        density: Option<&Array2<f32>>,
    ) -> FloodResult<ZonalMetrics> {
        if let Some(d) = density {
            if d.dim() != map.grid.shape() {
                return Err(FloodError::Processing(format!(
                    "population grid {:?} has mismatched shape (raster is {:?})",
                    d.dim(),
                    map.grid.shape()
                )));
            }
        }

        let polygon_area_km2 = Self::polygon_area_km2(polygon);
        if polygon_area_km2 <= 0.0 {
            return Err(FloodError::InvalidInput(
                "administrative polygon has zero area".to_string(),
            ));
        }

        let mut flooded_area_km2 = 0.0f64;
        let mut flooded_population = 0.0f64;
        let mut valid_pixels = 0usize;
        let mut total_pixels = 0usize;
        let mut clear_sum = 0.0f64;
        let mut clear_count = 0usize;

        for row in 0..map.grid.height {
            let pixel_area = map.grid.pixel_area_km2(row);
            for col in 0..map.grid.width {
                let coverage = self.coverage_fraction(&map.grid, row, col, polygon);
                if coverage == 0.0 {
                    continue;
                }
                total_pixels += 1;

                if map.flooded[[row, col]] == BAND_NODATA {
                    continue;
                }
                valid_pixels += 1;

                let perc = map.clear_perc_scaled[[row, col]];
                if perc != BAND_NODATA {
                    clear_sum += f64::from(perc) / 100.0;
                    clear_count += 1;
                }

                if map.flooded[[row, col]] == 1 {
                    let wet_area = pixel_area * coverage;
                    flooded_area_km2 += wet_area;
                    if let Some(d) = density {
                        let rho = f64::from(d[[row, col]]);
                        if rho.is_finite() && rho > 0.0 {
                            flooded_population += rho * wet_area;
                        }
                    }
                }
            }
        }

        // The raster is clipped to the polygon, so the flooded area is
        // bounded by the polygon area up to supersampling error
        if flooded_area_km2 > polygon_area_km2 {
            log::debug!(
                "Flooded area {:.3} km2 exceeds polygon area {:.3} km2 by discretization; clamping",
                flooded_area_km2,
                polygon_area_km2
            );
            flooded_area_km2 = polygon_area_km2;
        }

        let no_usable_imagery = valid_pixels == 0;
        if no_usable_imagery {
            flooded_area_km2 = 0.0;
            flooded_population = 0.0;
        }

        Ok(ZonalMetrics {
            flooded_population,
            flooded_area_km2,
            flooded_area_norm: flooded_area_km2 / polygon_area_km2,
            polygon_area_km2,
            valid_pixels,
            total_pixels,
            clear_fraction: if clear_count > 0 {
                Some(clear_sum / clear_count as f64)
            } else {
                None
            },
            no_usable_imagery,
        })
    }
}

impl Default for ZonalAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BandImage, BoundingBox, GridSpec};
    use approx::assert_relative_eq;
    use geo::polygon;

    /// 1x1 degree polygon at the equator, ~111.2 km on a side
    fn square_polygon() -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: 10.0, y: 0.0),
            (x: 11.0, y: 0.0),
            (x: 11.0, y: 1.0),
            (x: 10.0, y: 1.0),
        ]])
    }

    fn square_grid() -> GridSpec {
        let bbox = BoundingBox {
            min_lon: 10.0,
            max_lon: 11.0,
            min_lat: 0.0,
            max_lat: 1.0,
        };
        GridSpec::from_bbox(&bbox, 0.1).unwrap()
    }

    fn uniform_map(grid: &GridSpec, flooded: i16) -> FloodMapRaster {
        let shape = grid.shape();
        FloodMapRaster {
            grid: grid.clone(),
            flooded: BandImage::from_elem(shape, flooded),
            duration: BandImage::from_elem(shape, if flooded > 0 { 1 } else { 0 }),
            clear_views: BandImage::from_elem(shape, 3),
            clear_perc_scaled: BandImage::from_elem(shape, 80),
        }
    }

    #[test]
    fn polygon_area_matches_spherical_expectation() {
        let area = ZonalAggregator::polygon_area_km2(&square_polygon());
        // One square degree at the equator is about 12,364 km2
        assert_relative_eq!(area, 12_364.0, max_relative = 0.01);
    }

    #[test]
    fn fully_flooded_polygon_has_norm_near_one() {
        let grid = square_grid();
        let map = uniform_map(&grid, 1);
        let metrics = ZonalAggregator::new()
            .aggregate(&map, &square_polygon(), None)
            .unwrap();
        assert!(metrics.flooded_area_km2 > 0.0);
        assert!(metrics.flooded_area_km2 <= metrics.polygon_area_km2);
        assert_relative_eq!(metrics.flooded_area_norm, 1.0, max_relative = 0.02);
        assert_relative_eq!(
            metrics.flooded_area_norm,
            metrics.flooded_area_km2 / metrics.polygon_area_km2,
            max_relative = 1e-12
        );
    }

    #[test]
    fn unflooded_polygon_is_genuinely_zero() {
        let grid = square_grid();
        let map = uniform_map(&grid, 0);
        let metrics = ZonalAggregator::new()
            .aggregate(&map, &square_polygon(), None)
            .unwrap();
        assert_eq!(metrics.flooded_area_km2, 0.0);
        assert_eq!(metrics.flooded_population, 0.0);
        assert!(!metrics.no_usable_imagery);
        assert!(metrics.valid_pixels > 0);
        assert_relative_eq!(metrics.clear_fraction.unwrap(), 0.8, max_relative = 1e-9);
    }

    #[test]
    fn nodata_raster_reports_no_usable_imagery() {
        let grid = square_grid();
        let map = uniform_map(&grid, BAND_NODATA);
        let metrics = ZonalAggregator::new()
            .aggregate(&map, &square_polygon(), None)
            .unwrap();
        assert!(metrics.no_usable_imagery);
        assert_eq!(metrics.valid_pixels, 0);
        assert!(metrics.total_pixels > 0);
        assert_eq!(metrics.flooded_area_km2, 0.0);
        assert_eq!(metrics.flooded_population, 0.0);
        assert_eq!(metrics.flooded_area_norm, 0.0);
    }

    #[test]
    fn population_weighted_by_density_and_area() {
        let grid = square_grid();
        let mut map = uniform_map(&grid, 0);
        // One interior flooded pixel, fully inside the polygon
        map.flooded[[5, 5]] = 1;
        let density = Array2::from_elem(grid.shape(), 50.0f32);
        let metrics = ZonalAggregator::new()
            .aggregate(&map, &square_polygon(), Some(&density))
            .unwrap();
        let pixel_area = grid.pixel_area_km2(5);
        assert_relative_eq!(metrics.flooded_area_km2, pixel_area, max_relative = 1e-9);
        assert_relative_eq!(
            metrics.flooded_population,
            50.0 * pixel_area,
            max_relative = 1e-9
        );
    }

    #[test]
    fn boundary_pixels_contribute_fractionally() {
        // Polygon covering the western half of one pixel
        let grid = GridSpec::from_bbox(
            &BoundingBox {
                min_lon: 0.0,
                max_lon: 0.1,
                min_lat: 0.0,
                max_lat: 0.1,
            },
            0.1,
        )
        .unwrap();
        let half = MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 0.05, y: 0.0),
            (x: 0.05, y: 0.1),
            (x: 0.0, y: 0.1),
        ]]);
        let map = uniform_map(&grid, 1);
        let metrics = ZonalAggregator::new()
            .aggregate(&map, &half, None)
            .unwrap();
        let pixel_area = grid.pixel_area_km2(0);
        assert_relative_eq!(
            metrics.flooded_area_km2,
            0.5 * pixel_area,
            max_relative = 0.05
        );
    }

    #[test]
    fn mismatched_population_grid_is_an_error() {
        let grid = square_grid();
        let map = uniform_map(&grid, 1);
        let density = Array2::from_elem((2, 2), 50.0f32);
        let err = ZonalAggregator::new().aggregate(&map, &square_polygon(), Some(&density));
        assert!(matches!(err, Err(FloodError::Processing(_))));
    }
}
