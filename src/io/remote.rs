use chrono::{Duration as ChronoDuration, NaiveDate};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::aux_masks::read_band_nearest;
use crate::io::scenes::{Scene, SceneProvider, SceneQuery};
use crate::types::{FloodError, FloodResult, GridSpec, ProviderError};

/// Remote granule archive configuration.
///
/// The archive serves one GeoTIFF granule per acquisition date, with bands
/// {red, nir, qa}; a QA value of zero marks a clear observation.
#[derive(Debug, Clone)]
pub struct RemoteSceneConfig {
    /// Granule URL template; `{date}` is replaced with the acquisition date
    /// formatted as YYYY-MM-DD
    pub url_template: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Downloaded granules are kept here and reused across events
    pub cache_dir: PathBuf,
}

impl RemoteSceneConfig {
    pub fn new(url_template: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            url_template: url_template.into(),
            timeout: Duration::from_secs(30),
            cache_dir: cache_dir.into(),
        }
    }
}

/// Scene provider backed by an HTTP granule archive.
///
/// Granules are fetched one acquisition date at a time, cached on disk, and
/// resampled onto the working grid. A missing date (HTTP 404) is an absent
/// acquisition, not an error; rate limits and server errors surface as
/// transient so the retry layer can back off.
pub struct HttpSceneProvider {
    config: RemoteSceneConfig,
    client: reqwest::blocking::Client,
}

impl HttpSceneProvider {
    pub fn new(config: RemoteSceneConfig) -> FloodResult<Self> {
        std::fs::create_dir_all(&config.cache_dir)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("inundata/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                FloodError::Processing(format!("failed to create HTTP client: {}", e))
            })?;
        Ok(Self { config, client })
    }

    /// Granule URL for one acquisition date
    pub fn granule_url(&self, date: NaiveDate) -> String {
        self.config
            .url_template
            .replace("{date}", &date.format("%Y-%m-%d").to_string())
    }

    fn cache_path(&self, date: NaiveDate) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("granule_{}.tif", date.format("%Y%m%d")))
    }

    /// Download one granule unless already cached. None means the archive
    /// has no acquisition for this date.
    fn fetch_granule(&self, date: NaiveDate) -> Result<Option<PathBuf>, ProviderError> {
        let path = self.cache_path(date);
        if path.exists() {
            log::debug!("Granule cache hit for {}", date);
            return Ok(Some(path));
        }

        let url = self.granule_url(date);
        log::debug!("Fetching granule from {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ProviderError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let message = format!("HTTP {} for {}", status.as_u16(), url);
            return if is_transient_status(status.as_u16()) {
                Err(ProviderError::Transient(message))
            } else {
                Err(ProviderError::Fatal(message))
            };
        }

        let content = response
            .bytes()
            .map_err(|e| ProviderError::Transient(format!("failed to read body: {}", e)))?;
        // A granule smaller than a TIFF header is an error page in disguise
        if content.len() < 1024 {
            return Err(ProviderError::Transient(format!(
                "granule for {} too small ({} bytes)",
                date,
                content.len()
            )));
        }
        std::fs::write(&path, &content)
            .map_err(|e| ProviderError::Fatal(format!("failed to cache granule: {}", e)))?;
        log::info!("Cached granule for {} ({} bytes)", date, content.len());
        Ok(Some(path))
    }

    /// Open a cached granule and resample its bands onto the working grid
    fn scene_from_granule(
        &self,
        path: &Path,
        date: NaiveDate,
        grid: &GridSpec,
    ) -> Result<Scene, ProviderError> {
        let read = |band| {
            read_band_nearest(path, band, grid)
                .map_err(|e| ProviderError::Fatal(format!("unreadable granule {}: {}", date, e)))
        };
        let red = read(1)?;
        let nir = read(2)?;
        let qa = read(3)?;

        let shape = grid.shape();
        let mut valid = Array2::from_elem(shape, false);
        for row in 0..shape.0 {
            for col in 0..shape.1 {
                let q = qa[[row, col]];
                valid[[row, col]] = q.is_finite()
                    && q == 0.0
                    && red[[row, col]].is_finite()
                    && nir[[row, col]].is_finite();
            }
        }

        Ok(Scene {
            acquired: date,
            red,
            nir,
            valid,
        })
    }
}

impl SceneProvider for HttpSceneProvider {
    fn query(&self, query: &SceneQuery) -> Result<Vec<Scene>, ProviderError> {
        let mut scenes = Vec::new();
        let mut date = query.start;
        while date <= query.end {
            if let Some(path) = self.fetch_granule(date)? {
                scenes.push(self.scene_from_granule(&path, date, &query.grid)?);
            }
            date = date + ChronoDuration::days(1);
        }
        log::debug!(
            "{} granules available between {} and {}",
            scenes.len(),
            query.start,
            query.end
        );
        Ok(scenes)
    }
}

/// Server responses worth retrying: rate limits, timeouts, 5xx
fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}
