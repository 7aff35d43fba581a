use gdal::Dataset;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::types::{BoolMask, FloodError, FloodResult, GridSpec};

/// Auxiliary mask thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskParams {
    /// Slope (degrees) at or above which a pixel is excluded from flood
    /// candidacy. Steep slopes are physically implausible flood zones and a
    /// frequent source of false positives.
    pub slope_cutoff_deg: f32,
    /// Water occurrence (percent of the historical record) at or above which
    /// a pixel counts as perennial water
    pub water_occurrence_pct: f32,
}

impl Default for MaskParams {
    fn default() -> Self {
        Self {
            slope_cutoff_deg: 5.0,
            water_occurrence_pct: 75.0,
        }
    }
}

/// What the terrain dataset stores per pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerrainSource {
    /// Pre-computed slope in degrees
    SlopeDegrees,
    /// Elevation in meters; slope is derived on the working grid
    ElevationMeters,
}

/// Boolean exclusion masks on the working grid
#[derive(Debug, Clone)]
pub struct MaskSet {
    pub grid: GridSpec,
    pub steep: BoolMask,
    pub permanent_water: BoolMask,
}

impl MaskSet {
    /// Masks that exclude nothing; for extents with no auxiliary coverage
    pub fn open(grid: &GridSpec) -> Self {
        let shape = grid.shape();
        Self {
            grid: grid.clone(),
            steep: Array2::from_elem(shape, false),
            permanent_water: Array2::from_elem(shape, false),
        }
    }
}

/// Resolves exclusion masks for a working grid. The file-backed
/// [`AuxMaskProvider`] is the production implementation; tests substitute
/// synthetic masks.
pub trait MaskProvider: Send + Sync {
    fn masks(&self, grid: &GridSpec) -> FloodResult<Arc<MaskSet>>;
}

/// Cache key derived from a grid's georeferencing; masks are time-invariant
/// so one extent resolves to one mask set for the life of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GridKey {
    tlx: u64,
    tly: u64,
    pw: u64,
    ph: u64,
    width: usize,
    height: usize,
}

impl GridKey {
    fn of(grid: &GridSpec) -> Self {
        Self {
            tlx: grid.transform.top_left_x.to_bits(),
            tly: grid.transform.top_left_y.to_bits(),
            pw: grid.transform.pixel_width.to_bits(),
            ph: grid.transform.pixel_height.to_bits(),
            width: grid.width,
            height: grid.height,
        }
    }
}

/// Resolves terrain-slope and permanent-water masks for a geographic extent,
/// resampled onto the working grid by nearest neighbor (boolean semantics
/// are preserved; no interpolation produces fractional categories).
pub struct AuxMaskProvider {
    terrain_path: PathBuf,
    terrain_source: TerrainSource,
    water_path: PathBuf,
    params: MaskParams,
    cache: Mutex<HashMap<GridKey, Arc<MaskSet>>>,
}

impl AuxMaskProvider {
    /// Missing datasets are a batch-level configuration error, reported
    /// before any event is processed.
    pub fn new(
        terrain_path: impl Into<PathBuf>,
        terrain_source: TerrainSource,
        water_path: impl Into<PathBuf>,
        params: MaskParams,
    ) -> FloodResult<Self> {
        let terrain_path = terrain_path.into();
        let water_path = water_path.into();
        for (path, what) in [(&terrain_path, "terrain"), (&water_path, "permanent water")] {
            if !path.exists() {
                return Err(FloodError::InvalidInput(format!(
                    "{} dataset not found: {}",
                    what,
                    path.display()
                )));
            }
        }
        Ok(Self {
            terrain_path,
            terrain_source,
            water_path,
            params,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Masks for one extent, from cache when previously resolved
    fn resolve(&self, grid: &GridSpec) -> FloodResult<Arc<MaskSet>> {
        let key = GridKey::of(grid);
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            log::debug!("Mask cache hit for {}x{} grid", grid.height, grid.width);
            return Ok(Arc::clone(cached));
        }

        let masks = Arc::new(self.build_masks(grid)?);
        self.cache
            .lock()
            .unwrap()
            .insert(key, Arc::clone(&masks));
        Ok(masks)
    }

    fn build_masks(&self, grid: &GridSpec) -> FloodResult<MaskSet> {
        log::info!(
            "Resolving auxiliary masks for {}x{} grid",
            grid.height,
            grid.width
        );

        let slope_deg = match self.terrain_source {
            TerrainSource::SlopeDegrees => read_band_nearest(&self.terrain_path, 1, grid)?,
            TerrainSource::ElevationMeters => {
                let dem = read_band_nearest(&self.terrain_path, 1, grid)?;
                slope_from_dem(&dem, grid)
            }
        };
        let occurrence = read_band_nearest(&self.water_path, 1, grid)?;

        let steep = slope_deg.mapv(|v| v.is_finite() && v >= self.params.slope_cutoff_deg);
        let permanent_water =
            occurrence.mapv(|v| v.is_finite() && v >= self.params.water_occurrence_pct);

        let n_steep = steep.iter().filter(|&&b| b).count();
        let n_water = permanent_water.iter().filter(|&&b| b).count();
        log::debug!(
            "Masks: {} steep pixels, {} permanent-water pixels of {}",
            n_steep,
            n_water,
            grid.num_pixels()
        );

        Ok(MaskSet {
            grid: grid.clone(),
            steep,
            permanent_water,
        })
    }
}

impl MaskProvider for AuxMaskProvider {
    fn masks(&self, grid: &GridSpec) -> FloodResult<Arc<MaskSet>> {
        self.resolve(grid)
    }
}

/// Read one band of a geo-referenced raster, resampled onto the working
/// grid by nearest neighbor. Grid pixels outside the dataset's coverage come
/// back NaN.
pub fn read_band_nearest(path: &Path, band_index: isize, grid: &GridSpec) -> FloodResult<Array2<f32>> {
    log::debug!(
        "Reading {} band {} onto working grid",
        path.display(),
        band_index
    );

    let dataset = Dataset::open(path)?;
    let gt = dataset.geo_transform()?;
    let (src_width, src_height) = dataset.raster_size();

    // Source window covering the grid's bounding box, clipped to the dataset
    let bbox = grid.bbox();
    let col_of = |lon: f64| ((lon - gt[0]) / gt[1]).floor();
    let row_of = |lat: f64| ((lat - gt[3]) / gt[5]).floor();
    let min_col = col_of(bbox.min_lon).max(0.0) as usize;
    let max_col = (col_of(bbox.max_lon) as isize).min(src_width as isize - 1);
    let min_row = row_of(bbox.max_lat).max(0.0) as usize;
    let max_row = (row_of(bbox.min_lat) as isize).min(src_height as isize - 1);

    if max_col < min_col as isize || max_row < min_row as isize {
        return Err(FloodError::Processing(format!(
            "extent {:?} does not overlap dataset coverage of {}",
            bbox,
            path.display()
        )));
    }
    let (max_col, max_row) = (max_col as usize, max_row as usize);
    let win_width = max_col - min_col + 1;
    let win_height = max_row - min_row + 1;

    let band = dataset.rasterband(band_index)?;
    let nodata = band.no_data_value();
    let buffer = band.read_as::<f32>(
        (min_col as isize, min_row as isize),
        (win_width, win_height),
        (win_width, win_height),
        None,
    )?;
    let window = Array2::from_shape_vec((win_height, win_width), buffer.data)
        .map_err(|e| FloodError::Processing(format!("failed to reshape raster window: {}", e)))?;

    // Nearest-neighbor sample at each working-grid pixel center
    let mut out = Array2::<f32>::from_elem(grid.shape(), f32::NAN);
    for row in 0..grid.height {
        for col in 0..grid.width {
            let (lon, lat) = grid.pixel_center(row, col);
            let src_col = ((lon - gt[0]) / gt[1]).floor() as isize - min_col as isize;
            let src_row = ((lat - gt[3]) / gt[5]).floor() as isize - min_row as isize;
            if src_col < 0
                || src_row < 0
                || src_col >= win_width as isize
                || src_row >= win_height as isize
            {
                continue;
            }
            let value = window[[src_row as usize, src_col as usize]];
            if let Some(nd) = nodata {
                if (f64::from(value) - nd).abs() < f64::EPSILON {
                    continue;
                }
            }
            out[[row, col]] = value;
        }
    }

    Ok(out)
}

/// Slope in degrees from an elevation grid, by central differences with
/// latitude-corrected pixel spacing. Edge rows/columns copy their nearest
/// interior neighbor; NaN elevations propagate to NaN slopes.
pub fn slope_from_dem(dem: &Array2<f32>, grid: &GridSpec) -> Array2<f32> {
    let (rows, cols) = dem.dim();
    let mut slope = Array2::<f32>::from_elem((rows, cols), f32::NAN);
    if rows < 3 || cols < 3 {
        return slope;
    }

    let deg_to_m = 111_194.9;
    let dy_m = (grid.transform.pixel_height.abs() * deg_to_m) as f32;

    for i in 1..rows - 1 {
        let (_, lat) = grid.pixel_center(i, 0);
        let dx_m = (grid.transform.pixel_width.abs() * deg_to_m * lat.to_radians().cos()) as f32;
        for j in 1..cols - 1 {
            let dz_dx = (dem[[i, j + 1]] - dem[[i, j - 1]]) / (2.0 * dx_m);
            let dz_dy = (dem[[i + 1, j]] - dem[[i - 1, j]]) / (2.0 * dy_m);
            slope[[i, j]] = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan().to_degrees();
        }
    }

    // Edges copy nearest interior values
    for j in 0..cols {
        let jj = j.clamp(1, cols - 2);
        slope[[0, j]] = slope[[1, jj]];
        slope[[rows - 1, j]] = slope[[rows - 2, jj]];
    }
    for i in 0..rows {
        let ii = i.clamp(1, rows - 2);
        slope[[i, 0]] = slope[[ii, 1]];
        slope[[i, cols - 1]] = slope[[ii, cols - 2]];
    }

    slope
}
