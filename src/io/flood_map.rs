use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::{Path, PathBuf};

use crate::core::classifier::FloodMapRaster;
use crate::types::{EventKey, FloodError, FloodResult, GeoTransform, GridSpec, BAND_NODATA};

/// Persists one 4-band classification artifact per event as an Int16
/// GeoTIFF, addressed by the event's canonical key.
///
/// Band order is fixed as {flooded, duration, clear_views,
/// clear_perc_scaled}; every band carries the no-data value -1 so absent
/// data stays distinguishable from valid zeros after a round trip.
pub struct FloodMapStore {
    root: PathBuf,
}

impl FloodMapStore {
    pub fn new(root: impl Into<PathBuf>) -> FloodResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Artifact path for an event
    pub fn path_for(&self, key: &EventKey) -> PathBuf {
        self.root.join(format!("{}.tif", key.canonical()))
    }

    pub fn exists(&self, key: &EventKey) -> bool {
        self.path_for(key).exists()
    }

    /// Write an event's flood map; returns the artifact path
    pub fn write(&self, key: &EventKey, map: &FloodMapRaster) -> FloodResult<PathBuf> {
        let path = self.path_for(key);
        log::info!("Writing flood map for {} to {}", key, path.display());

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<i16, _>(
            &path,
            map.grid.width as isize,
            map.grid.height as isize,
            4,
        )?;
        dataset.set_geo_transform(&map.grid.transform.to_gdal())?;
        dataset.set_spatial_ref(&SpatialRef::from_epsg(4326)?)?;

        for (i, (band_data, name)) in map
            .bands()
            .iter()
            .zip(FloodMapRaster::BAND_NAMES)
            .enumerate()
        {
            let mut band = dataset.rasterband(i as isize + 1)?;
            band.set_no_data_value(Some(f64::from(BAND_NODATA)))?;
            band.set_description(name)?;
            let buffer = Buffer::new(
                (map.grid.width, map.grid.height),
                band_data.iter().copied().collect(),
            );
            band.write((0, 0), (map.grid.width, map.grid.height), &buffer)?;
        }

        Ok(path)
    }

    /// Read an event's flood map back from storage
    pub fn read(&self, key: &EventKey) -> FloodResult<FloodMapRaster> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(FloodError::Processing(format!(
                "flood map artifact not found for {}: {}",
                key,
                path.display()
            )));
        }
        read_flood_map(&path)
    }
}

/// Read a persisted 4-band classification artifact
pub fn read_flood_map(path: &Path) -> FloodResult<FloodMapRaster> {
    let dataset = Dataset::open(path)?;
    if dataset.raster_count() != 4 {
        return Err(FloodError::Processing(format!(
            "{} has {} bands, expected 4",
            path.display(),
            dataset.raster_count()
        )));
    }

    let (width, height) = dataset.raster_size();
    let grid = GridSpec {
        transform: GeoTransform::from_gdal(dataset.geo_transform()?),
        width,
        height,
    };

    let mut bands = Vec::with_capacity(4);
    for i in 1..=4isize {
        let band = dataset.rasterband(i)?;
        let buffer = band.read_as::<i16>((0, 0), (width, height), (width, height), None)?;
        let array = Array2::from_shape_vec((height, width), buffer.data).map_err(|e| {
            FloodError::Processing(format!("failed to reshape band {}: {}", i, e))
        })?;
        bands.push(array);
    }
    let clear_perc_scaled = bands.pop().unwrap();
    let clear_views = bands.pop().unwrap();
    let duration = bands.pop().unwrap();
    let flooded = bands.pop().unwrap();

    Ok(FloodMapRaster {
        grid,
        flooded,
        duration,
        clear_views,
        clear_perc_scaled,
    })
}
