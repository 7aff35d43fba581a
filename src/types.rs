use chrono::NaiveDate;
use geo::MultiPolygon;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Per-pixel spectral index values (NaN marks pixels with no valid observation)
pub type IndexImage = Array2<f32>;

/// Per-pixel valid-observation counts
pub type CountImage = Array2<u32>;

/// Boolean exclusion mask on the working grid
pub type BoolMask = Array2<bool>;

/// One band of the persisted classification artifact
pub type BandImage = Array2<i16>;

/// No-data sentinel used in every band of the classification artifact.
/// Distinct from a valid 0 (not flooded / zero duration / zero clear views).
pub const BAND_NODATA: i16 = -1;

/// First date with usable imagery (Terra MODIS science data start)
pub fn mission_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 2, 25).unwrap()
}

/// Geospatial bounding box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Axis-aligned bounds of a polygon's exterior rings
    pub fn from_polygon(polygon: &MultiPolygon<f64>) -> Option<Self> {
        use geo::BoundingRect;
        let rect = polygon.bounding_rect()?;
        Some(Self {
            min_lon: rect.min().x,
            max_lon: rect.max().x,
            min_lat: rect.min().y,
            max_lat: rect.max().y,
        })
    }

    pub fn width_deg(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height_deg(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// GDAL-ordered coefficient array
    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }
}

/// Mean Earth radius used for pixel/polygon area conversions (km)
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// A north-up geographic grid: georeferencing plus raster dimensions.
///
/// All rasters flowing through one event (composites, masks, classification
/// bands, population) are co-registered on a single `GridSpec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSpec {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

impl GridSpec {
    /// Build a grid covering a bounding box at the given pixel size (degrees).
    /// The grid snaps outward so the box is fully covered.
    pub fn from_bbox(bbox: &BoundingBox, pixel_size_deg: f64) -> FloodResult<Self> {
        if pixel_size_deg <= 0.0 {
            return Err(FloodError::InvalidInput(format!(
                "pixel size must be positive, got {}",
                pixel_size_deg
            )));
        }
        if bbox.width_deg() <= 0.0 || bbox.height_deg() <= 0.0 {
            return Err(FloodError::InvalidInput(format!(
                "degenerate bounding box: {:?}",
                bbox
            )));
        }
        let width = (bbox.width_deg() / pixel_size_deg).ceil() as usize;
        let height = (bbox.height_deg() / pixel_size_deg).ceil() as usize;
        Ok(Self {
            transform: GeoTransform {
                top_left_x: bbox.min_lon,
                pixel_width: pixel_size_deg,
                rotation_x: 0.0,
                top_left_y: bbox.max_lat,
                rotation_y: 0.0,
                pixel_height: -pixel_size_deg,
            },
            width,
            height,
        })
    }

    /// (rows, cols) for ndarray allocation
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn num_pixels(&self) -> usize {
        self.height * self.width
    }

    /// Geographic coordinates of a pixel center
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let lon = self.transform.top_left_x + (col as f64 + 0.5) * self.transform.pixel_width;
        let lat = self.transform.top_left_y + (row as f64 + 0.5) * self.transform.pixel_height;
        (lon, lat)
    }

    /// Geographic area of one pixel in a given row (km^2).
    /// Longitude spacing shrinks with cos(latitude); rows share a latitude.
    pub fn pixel_area_km2(&self, row: usize) -> f64 {
        let (_, lat) = self.pixel_center(row, 0);
        let deg_to_km = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;
        let dy_km = self.transform.pixel_height.abs() * deg_to_km;
        let dx_km = self.transform.pixel_width.abs() * deg_to_km * lat.to_radians().cos();
        dx_km * dy_km
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox {
            min_lon: self.transform.top_left_x,
            max_lon: self.transform.top_left_x + self.width as f64 * self.transform.pixel_width,
            min_lat: self.transform.top_left_y + self.height as f64 * self.transform.pixel_height,
            max_lat: self.transform.top_left_y,
        }
    }

    /// True when two grids share georeferencing and dimensions closely enough
    /// to be combined pixel-by-pixel
    pub fn is_aligned_with(&self, other: &GridSpec) -> bool {
        let tol = 1e-9;
        self.width == other.width
            && self.height == other.height
            && (self.transform.top_left_x - other.transform.top_left_x).abs() < tol
            && (self.transform.top_left_y - other.transform.top_left_y).abs() < tol
            && (self.transform.pixel_width - other.transform.pixel_width).abs() < tol
            && (self.transform.pixel_height - other.transform.pixel_height).abs() < tol
    }
}

/// How record-level impacts were allocated onto this disaggregated sub-event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationMethod {
    /// Impacts split across admin units in proportion to population
    PopulationWeighted,
    /// Original record named a single admin unit; reported value used directly
    DirectReported,
}

/// Composite key identifying one disaggregated flood event:
/// source record, calendar month, and admin1 unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Source disaster-record identifier (e.g. "2024-0421")
    pub record_id: String,
    /// Calendar month of this sub-event, "MM-YYYY"
    pub mon_yr: String,
    /// Admin1 boundary code the sub-event is bound to
    pub adm1_code: i64,
}

impl EventKey {
    pub fn new(record_id: impl Into<String>, mon_yr: impl Into<String>, adm1_code: i64) -> Self {
        Self {
            record_id: record_id.into(),
            mon_yr: mon_yr.into(),
            adm1_code,
        }
    }

    /// Canonical identifier, used to address persisted artifacts
    pub fn canonical(&self) -> String {
        format!("{}-{}-{}", self.record_id, self.mon_yr, self.adm1_code)
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// One disaggregated disaster event bound to an admin1 polygon and a time
/// window. Immutable input to the processing core.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub key: EventKey,
    /// Inclusive event window
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Country reported by the source disaster record
    pub country: String,
    /// Country of the matched admin1 polygon per the boundary dataset
    pub boundary_country: String,
    pub adm1_name: String,
    pub polygon: MultiPolygon<f64>,
    pub allocation: AllocationMethod,
    /// Start/end day were missing upstream and defaulted during disaggregation
    pub start_day_estimated: bool,
    pub end_day_estimated: bool,
}

impl EventRecord {
    /// Inclusive event duration in days
    pub fn duration_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    /// Reject events the core cannot process: inverted windows and
    /// empty/degenerate polygons.
    pub fn validate(&self) -> FloodResult<()> {
        if self.end_date < self.start_date {
            return Err(FloodError::InvalidInput(format!(
                "event {}: end date {} precedes start date {}",
                self.key, self.end_date, self.start_date
            )));
        }
        if self.polygon.0.is_empty() {
            return Err(FloodError::InvalidInput(format!(
                "event {}: empty administrative polygon",
                self.key
            )));
        }
        if BoundingBox::from_polygon(&self.polygon).is_none() {
            return Err(FloodError::InvalidInput(format!(
                "event {}: polygon has no finite extent",
                self.key
            )));
        }
        Ok(())
    }
}

/// Error from the imagery provider or export backend
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Network/rate-limit/service error worth retrying
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Malformed request or permanent backend rejection
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Error types for flood processing
#[derive(Debug, thiserror::Error)]
pub enum FloodError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Result type for flood processing operations
pub type FloodResult<T> = Result<T, FloodError>;
