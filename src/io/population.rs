use ndarray::Array2;
use std::path::{Path, PathBuf};

use crate::io::aux_masks::read_band_nearest;
use crate::types::{FloodError, FloodResult, GridSpec};

/// Why population density could not be resolved for an extent. These map to
/// quality flags rather than processing failures: the event still produces a
/// (flagged) metrics record without population weighting.
#[derive(Debug, thiserror::Error)]
pub enum PopulationError {
    /// No population raster covers the requested extent
    #[error("population data missing: {0}")]
    Missing(String),

    /// Population data exists but cannot be aligned with the flood grid
    #[error("population grid mismatch: {0}")]
    Mismatched(String),

    #[error(transparent)]
    Other(#[from] FloodError),
}

/// Static gridded population density (persons/km^2), queried by extent
pub trait PopulationSource: Send + Sync {
    /// Density resampled onto the working grid
    fn density(&self, grid: &GridSpec) -> Result<Array2<f32>, PopulationError>;
}

/// Population density from a GeoTIFF covering the study area
pub struct GeoTiffPopulation {
    path: PathBuf,
}

impl GeoTiffPopulation {
    /// An unreadable path is a batch-level configuration error
    pub fn new(path: impl Into<PathBuf>) -> FloodResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(FloodError::InvalidInput(format!(
                "population dataset not found: {}",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PopulationSource for GeoTiffPopulation {
    fn density(&self, grid: &GridSpec) -> Result<Array2<f32>, PopulationError> {
        match read_band_nearest(&self.path, 1, grid) {
            Ok(density) => Ok(density),
            // A non-overlapping extent means no population coverage for this
            // admin unit, not a broken batch
            Err(FloodError::Processing(msg)) if msg.contains("does not overlap") => {
                Err(PopulationError::Missing(msg))
            }
            Err(e) => Err(PopulationError::Other(e)),
        }
    }
}

/// Fixed in-memory density grid; used by tests and by callers that have
/// already loaded population data
pub struct InMemoryPopulation {
    pub grid: GridSpec,
    pub density: Array2<f32>,
}

impl PopulationSource for InMemoryPopulation {
    fn density(&self, grid: &GridSpec) -> Result<Array2<f32>, PopulationError> {
        if !self.grid.is_aligned_with(grid) {
            return Err(PopulationError::Mismatched(format!(
                "population grid {}x{} does not match working grid {}x{}",
                self.grid.height, self.grid.width, grid.height, grid.width
            )));
        }
        Ok(self.density.clone())
    }
}
