use chrono::{Duration as ChronoDuration, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::io::scenes::{Scene, SceneProvider, SceneQuery};
use crate::types::{CountImage, FloodError, FloodResult, GridSpec, IndexImage};

/// Index compositing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositorParams {
    /// Length of the reference ("normal") window in days
    pub reference_days: u32,
    /// Gap between the end of the reference window and the event start,
    /// in days. The default of one year samples the same season.
    pub reference_gap_days: u32,
    /// Sub-interval length for duration compositing (days)
    pub interval_days: u32,
    /// Reflectance sums below this are treated as undefined when forming
    /// the normalized index
    pub index_epsilon: f32,
}

impl Default for CompositorParams {
    fn default() -> Self {
        Self {
            reference_days: 90,
            reference_gap_days: 365,
            interval_days: 8,
            index_epsilon: 1e-6,
        }
    }
}

/// Per-pixel composite of a spectral index over a date range, with the
/// number of valid observations that contributed to each pixel.
#[derive(Debug, Clone)]
pub struct CompositeRaster {
    pub grid: GridSpec,
    /// Median index value per pixel; NaN where no valid observation exists
    pub index: IndexImage,
    pub valid_obs: CountImage,
}

impl CompositeRaster {
    /// Number of pixels with at least one valid observation
    pub fn valid_pixels(&self) -> usize {
        self.valid_obs.iter().filter(|&&n| n > 0).count()
    }
}

/// Result of compositing a date range: either a usable composite or the
/// distinct no-coverage condition (zero valid observations anywhere in the
/// extent). No-coverage is reported to the caller, never raised as an error.
#[derive(Debug, Clone)]
pub enum CompositeOutcome {
    Composite(CompositeRaster),
    NoCoverage,
}

impl CompositeOutcome {
    pub fn as_composite(&self) -> Option<&CompositeRaster> {
        match self {
            CompositeOutcome::Composite(c) => Some(c),
            CompositeOutcome::NoCoverage => None,
        }
    }
}

/// One discrete sub-interval of an event window (inclusive bounds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubInterval {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Composites for a full event window: the whole-window composite plus one
/// composite per sub-interval, from a single provider query.
#[derive(Debug)]
pub struct EventSeries {
    pub overall: CompositeOutcome,
    pub intervals: Vec<(SubInterval, CompositeOutcome)>,
}

/// Builds cloud-aware temporal composites of a water index from a scene
/// provider.
///
/// The per-scene index is the normalized difference of red and near-infrared
/// reflectance, `(red - nir) / (red + nir)`, which rises over inundated
/// surfaces. The compositing statistic is the median over valid observations:
/// robust to residual cloud and haze outliers, and deterministic for fixed
/// inputs (values are fully sorted; even-sized samples average the two middle
/// values).
pub struct IndexCompositor<'a> {
    provider: &'a dyn SceneProvider,
    params: CompositorParams,
}

impl<'a> IndexCompositor<'a> {
    pub fn new(provider: &'a dyn SceneProvider) -> Self {
        Self {
            provider,
            params: CompositorParams::default(),
        }
    }

    pub fn with_params(provider: &'a dyn SceneProvider, params: CompositorParams) -> Self {
        Self { provider, params }
    }

    pub fn params(&self) -> &CompositorParams {
        &self.params
    }

    /// Normalized water index for one observation, or NaN when undefined
    fn water_index(red: f32, nir: f32, epsilon: f32) -> f32 {
        let denom = red + nir;
        if !red.is_finite() || !nir.is_finite() || denom.abs() < epsilon {
            f32::NAN
        } else {
            (red - nir) / denom
        }
    }

    /// Reference window for an event starting on the given date
    pub fn reference_window(&self, event_start: NaiveDate) -> (NaiveDate, NaiveDate) {
        let end = event_start - ChronoDuration::days(i64::from(self.params.reference_gap_days));
        let start = end - ChronoDuration::days(i64::from(self.params.reference_days) - 1);
        (start, end)
    }

    /// Split an inclusive window into consecutive sub-intervals of
    /// `interval_days`; the last one is truncated at the window end.
    pub fn subintervals(&self, start: NaiveDate, end: NaiveDate) -> Vec<SubInterval> {
        let step = i64::from(self.params.interval_days.max(1));
        let mut intervals = Vec::new();
        let mut cursor = start;
        while cursor <= end {
            let interval_end = (cursor + ChronoDuration::days(step - 1)).min(end);
            intervals.push(SubInterval {
                start: cursor,
                end: interval_end,
            });
            cursor = interval_end + ChronoDuration::days(1);
        }
        intervals
    }

    /// Composite all valid observations from a set of scenes onto the grid.
    /// Pure with respect to the provider; scene order does not affect the
    /// result.
    pub fn composite_scenes(
        &self,
        grid: &GridSpec,
        scenes: &[Scene],
    ) -> FloodResult<CompositeOutcome> {
        for scene in scenes {
            if !scene.conforms_to(grid) {
                return Err(FloodError::Processing(format!(
                    "scene acquired {} does not conform to the working grid {}x{}",
                    scene.acquired, grid.height, grid.width
                )));
            }
        }

        let shape = grid.shape();
        let mut index = Array2::<f32>::from_elem(shape, f32::NAN);
        let mut valid_obs = Array2::<u32>::zeros(shape);
        let mut any_valid = false;

        let mut samples: Vec<f32> = Vec::with_capacity(scenes.len());
        for row in 0..shape.0 {
            for col in 0..shape.1 {
                samples.clear();
                for scene in scenes {
                    if !scene.valid[[row, col]] {
                        continue;
                    }
                    let value = Self::water_index(
                        scene.red[[row, col]],
                        scene.nir[[row, col]],
                        self.params.index_epsilon,
                    );
                    if value.is_finite() {
                        samples.push(value);
                    }
                }
                if samples.is_empty() {
                    continue;
                }
                any_valid = true;
                valid_obs[[row, col]] = samples.len() as u32;
                index[[row, col]] = median(&mut samples);
            }
        }

        if !any_valid {
            return Ok(CompositeOutcome::NoCoverage);
        }

        Ok(CompositeOutcome::Composite(CompositeRaster {
            grid: grid.clone(),
            index,
            valid_obs,
        }))
    }

    /// Query the provider and composite one date range
    pub fn composite(
        &self,
        grid: &GridSpec,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FloodResult<CompositeOutcome> {
        log::debug!("Compositing {} to {}", start, end);
        let scenes = self.provider.query(&SceneQuery {
            grid: grid.clone(),
            start,
            end,
        })?;
        if scenes.is_empty() {
            log::info!("No scenes available for {} to {}", start, end);
            return Ok(CompositeOutcome::NoCoverage);
        }
        self.composite_scenes(grid, &scenes)
    }

    /// Composite a full event window: one provider query, bucketed into the
    /// whole-window composite plus one composite per sub-interval.
    pub fn event_series(
        &self,
        grid: &GridSpec,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FloodResult<EventSeries> {
        let scenes = self.provider.query(&SceneQuery {
            grid: grid.clone(),
            start,
            end,
        })?;
        log::debug!(
            "Event window {} to {}: {} scenes retrieved",
            start,
            end,
            scenes.len()
        );

        let overall = self.composite_scenes(grid, &scenes)?;

        let mut intervals = Vec::new();
        for sub in self.subintervals(start, end) {
            let bucket: Vec<Scene> = scenes
                .iter()
                .filter(|s| s.acquired >= sub.start && s.acquired <= sub.end)
                .cloned()
                .collect();
            let outcome = if bucket.is_empty() {
                CompositeOutcome::NoCoverage
            } else {
                self.composite_scenes(grid, &bucket)?
            };
            intervals.push((sub, outcome));
        }

        Ok(EventSeries { overall, intervals })
    }
}

/// Median of a non-empty sample; sorts in place. Even-sized samples average
/// the two middle values so the statistic is deterministic.
fn median(samples: &mut [f32]) -> f32 {
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = samples.len();
    if n % 2 == 1 {
        samples[n / 2]
    } else {
        0.5 * (samples[n / 2 - 1] + samples[n / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, ProviderError};
    use approx::assert_relative_eq;

    fn small_grid() -> GridSpec {
        let bbox = BoundingBox {
            min_lon: 0.0,
            max_lon: 0.3,
            min_lat: 0.0,
            max_lat: 0.3,
        };
        GridSpec::from_bbox(&bbox, 0.1).unwrap()
    }

    fn uniform_scene(grid: &GridSpec, day: u32, red: f32, nir: f32) -> Scene {
        let shape = grid.shape();
        Scene {
            acquired: NaiveDate::from_ymd_opt(2024, 7, day).unwrap(),
            red: Array2::from_elem(shape, red),
            nir: Array2::from_elem(shape, nir),
            valid: Array2::from_elem(shape, true),
        }
    }

    struct FixedProvider {
        scenes: Vec<Scene>,
    }

    impl SceneProvider for FixedProvider {
        fn query(&self, _query: &SceneQuery) -> Result<Vec<Scene>, ProviderError> {
            Ok(self.scenes.clone())
        }
    }

    #[test]
    fn median_is_order_statistic() {
        assert_relative_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_relative_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_relative_eq!(median(&mut [7.5]), 7.5);
    }

    #[test]
    fn composite_takes_median_of_valid_observations() {
        let grid = small_grid();
        // Water indices: (0.3-0.1)/0.4 = 0.5, (0.1-0.3)/0.4 = -0.5, (0.2-0.2)/0.4 = 0.0
        let scenes = vec![
            uniform_scene(&grid, 1, 0.3, 0.1),
            uniform_scene(&grid, 9, 0.1, 0.3),
            uniform_scene(&grid, 17, 0.2, 0.2),
        ];
        let provider = FixedProvider { scenes };
        let compositor = IndexCompositor::new(&provider);
        let outcome = compositor
            .composite(
                &grid,
                NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 7, 31).unwrap(),
            )
            .unwrap();
        let composite = outcome.as_composite().expect("coverage expected");
        assert_relative_eq!(composite.index[[0, 0]], 0.0);
        assert_eq!(composite.valid_obs[[0, 0]], 3);
        assert_eq!(composite.valid_pixels(), grid.num_pixels());
    }

    #[test]
    fn cloudy_observations_are_excluded() {
        let grid = small_grid();
        let mut cloudy = uniform_scene(&grid, 1, 0.3, 0.1);
        cloudy.valid.fill(false);
        cloudy.valid[[0, 0]] = true;
        let provider = FixedProvider {
            scenes: vec![cloudy],
        };
        let compositor = IndexCompositor::new(&provider);
        let outcome = compositor
            .composite(
                &grid,
                NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 7, 8).unwrap(),
            )
            .unwrap();
        let composite = outcome.as_composite().unwrap();
        assert_eq!(composite.valid_pixels(), 1);
        assert!(composite.index[[1, 1]].is_nan());
        assert_eq!(composite.valid_obs[[1, 1]], 0);
    }

    #[test]
    fn zero_scenes_is_no_coverage_not_error() {
        let provider = FixedProvider { scenes: vec![] };
        let compositor = IndexCompositor::new(&provider);
        let grid = small_grid();
        let outcome = compositor
            .composite(
                &grid,
                NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 7, 31).unwrap(),
            )
            .unwrap();
        assert!(matches!(outcome, CompositeOutcome::NoCoverage));
    }

    #[test]
    fn compositing_is_deterministic_under_scene_order() {
        let grid = small_grid();
        let scenes = vec![
            uniform_scene(&grid, 1, 0.35, 0.15),
            uniform_scene(&grid, 9, 0.05, 0.45),
            uniform_scene(&grid, 17, 0.25, 0.25),
            uniform_scene(&grid, 25, 0.15, 0.35),
        ];
        let mut reversed = scenes.clone();
        reversed.reverse();

        let provider = FixedProvider { scenes: vec![] };
        let compositor = IndexCompositor::new(&provider);
        let a = compositor.composite_scenes(&grid, &scenes).unwrap();
        let b = compositor.composite_scenes(&grid, &reversed).unwrap();
        let (a, b) = (a.as_composite().unwrap(), b.as_composite().unwrap());
        assert_eq!(a.index, b.index);
        assert_eq!(a.valid_obs, b.valid_obs);
    }

    #[test]
    fn subintervals_cover_window_without_overlap() {
        let provider = FixedProvider { scenes: vec![] };
        let compositor = IndexCompositor::new(&provider);
        let start = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 7, 20).unwrap();
        let intervals = compositor.subintervals(start, end);
        assert_eq!(intervals.len(), 3); // 8 + 8 + 4 days
        assert_eq!(intervals[0].start, start);
        assert_eq!(intervals[2].end, end);
        for pair in intervals.windows(2) {
            assert_eq!(pair[1].start, pair[0].end + ChronoDuration::days(1));
        }
    }

    #[test]
    fn reference_window_precedes_event() {
        let provider = FixedProvider { scenes: vec![] };
        let compositor = IndexCompositor::new(&provider);
        let event_start = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let (ref_start, ref_end) = compositor.reference_window(event_start);
        assert_eq!(ref_end, NaiveDate::from_ymd_opt(2023, 7, 2).unwrap());
        assert_eq!((ref_end - ref_start).num_days(), 89);
        assert!(ref_end < event_start);
    }

    #[test]
    fn event_series_buckets_scenes_by_subinterval() {
        let grid = small_grid();
        let scenes = vec![
            uniform_scene(&grid, 2, 0.3, 0.1),  // first sub-interval
            uniform_scene(&grid, 12, 0.1, 0.3), // second sub-interval
        ];
        let provider = FixedProvider { scenes };
        let compositor = IndexCompositor::new(&provider);
        let series = compositor
            .event_series(
                &grid,
                NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 7, 24).unwrap(),
            )
            .unwrap();
        assert_eq!(series.intervals.len(), 3);
        assert!(series.intervals[0].1.as_composite().is_some());
        assert!(series.intervals[1].1.as_composite().is_some());
        assert!(matches!(series.intervals[2].1, CompositeOutcome::NoCoverage));
        let overall = series.overall.as_composite().unwrap();
        assert_eq!(overall.valid_obs[[0, 0]], 2);
    }
}
