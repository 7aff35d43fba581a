use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::core::compositor::{CompositeOutcome, CompositeRaster, SubInterval};
use crate::io::aux_masks::MaskSet;
use crate::types::{BandImage, FloodError, FloodResult, GridSpec, BAND_NODATA};

/// Flood classification thresholds.
///
/// The anomaly threshold is a domain-tuned constant; the default is a
/// conservative starting point and is expected to be overridden per study
/// region rather than treated as canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierParams {
    /// Minimum normalized index anomaly (event vs reference) for a flooded call
    pub anomaly_threshold: f32,
    /// Anomaly denominators below this mark the pixel not-flooded rather
    /// than dividing by a vanishing magnitude
    pub anomaly_epsilon: f32,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            anomaly_threshold: 0.15,
            anomaly_epsilon: 1e-6,
        }
    }
}

/// The per-event classification artifact: four co-registered bands with a
/// shared no-data sentinel, in the fixed external band order
/// {flooded, duration, clear_views, clear_perc_scaled}.
#[derive(Debug, Clone)]
pub struct FloodMapRaster {
    pub grid: GridSpec,
    /// 1 flooded, 0 not flooded, -1 no data
    pub flooded: BandImage,
    /// Number of event sub-intervals the pixel tested flooded in
    pub duration: BandImage,
    /// Number of event sub-intervals with at least one valid observation
    pub clear_views: BandImage,
    /// 100 * clear_views / total sub-intervals, rounded; -1 when the window
    /// has zero sub-intervals
    pub clear_perc_scaled: BandImage,
}

impl FloodMapRaster {
    pub const BAND_NAMES: [&'static str; 4] =
        ["flooded", "duration", "clear_views", "clear_perc_scaled"];

    /// Bands in the fixed external order
    pub fn bands(&self) -> [&BandImage; 4] {
        [
            &self.flooded,
            &self.duration,
            &self.clear_views,
            &self.clear_perc_scaled,
        ]
    }

    /// Pixels with a usable flooded/not-flooded call
    pub fn valid_pixels(&self) -> usize {
        self.flooded.iter().filter(|&&v| v != BAND_NODATA).count()
    }

    /// Mean cloud-clear fraction over pixels with a defined percentage,
    /// in [0, 1]. None when no pixel has one.
    pub fn mean_clear_fraction(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for &v in self.clear_perc_scaled.iter() {
            if v != BAND_NODATA {
                sum += f64::from(v) / 100.0;
                n += 1;
            }
        }
        if n == 0 {
            None
        } else {
            Some(sum / n as f64)
        }
    }
}

/// Per-pixel flood classification against a reference composite, corrected
/// for steep terrain and permanent water.
///
/// Classification is a pure function of the two composite values and the two
/// mask bits: no global state, no dependence on iteration order, so repeated
/// runs on identical inputs reproduce the output bit-for-bit.
pub struct FloodClassifier {
    params: ClassifierParams,
}

impl FloodClassifier {
    pub fn new() -> Self {
        Self {
            params: ClassifierParams::default(),
        }
    }

    pub fn with_params(params: ClassifierParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    /// Normalized anomaly of the event index against the reference index
    fn anomaly(&self, reference: f32, event: f32) -> f32 {
        let denom = reference.abs() + event.abs();
        if denom < self.params.anomaly_epsilon {
            0.0
        } else {
            (event - reference) / denom
        }
    }

    /// One pixel's flooded/not-flooded call; None when either composite
    /// value is undefined.
    fn classify_pixel(
        &self,
        reference: f32,
        event: f32,
        steep: bool,
        permanent_water: bool,
    ) -> Option<bool> {
        if !reference.is_finite() || !event.is_finite() {
            return None;
        }
        if steep || permanent_water {
            return Some(false);
        }
        Some(self.anomaly(reference, event) >= self.params.anomaly_threshold)
    }

    fn check_alignment(&self, grid: &GridSpec, other: &GridSpec, what: &str) -> FloodResult<()> {
        if !grid.is_aligned_with(other) {
            return Err(FloodError::Processing(format!(
                "{} grid is not co-registered with the reference composite",
                what
            )));
        }
        Ok(())
    }

    /// Classify an event window and assemble the 4-band artifact.
    ///
    /// `intervals` carries one composite per event sub-interval (the duration
    /// test re-applies the flooded predicate per sub-interval); `event` is
    /// the whole-window composite that drives the headline flooded band.
    pub fn classify(
        &self,
        reference: &CompositeRaster,
        event: &CompositeRaster,
        intervals: &[(SubInterval, CompositeOutcome)],
        masks: &MaskSet,
    ) -> FloodResult<FloodMapRaster> {
        let grid = &reference.grid;
        self.check_alignment(grid, &event.grid, "event composite")?;
        self.check_alignment(grid, &masks.grid, "mask")?;
        for (sub, outcome) in intervals {
            if let Some(composite) = outcome.as_composite() {
                self.check_alignment(grid, &composite.grid, "sub-interval composite")?;
            }
            if sub.end < sub.start {
                return Err(FloodError::Processing(format!(
                    "inverted sub-interval {} to {}",
                    sub.start, sub.end
                )));
            }
        }

        let shape = grid.shape();
        let total_intervals = intervals.len();
        let mut flooded = Array2::<i16>::from_elem(shape, BAND_NODATA);
        let mut duration = Array2::<i16>::from_elem(shape, BAND_NODATA);
        let mut clear_views = Array2::<i16>::zeros(shape);
        let mut clear_perc = Array2::<i16>::from_elem(shape, BAND_NODATA);

        for row in 0..shape.0 {
            for col in 0..shape.1 {
                let ref_val = reference.index[[row, col]];
                let steep = masks.steep[[row, col]];
                let permanent = masks.permanent_water[[row, col]];

                if let Some(is_flooded) = self.classify_pixel(
                    ref_val,
                    event.index[[row, col]],
                    steep,
                    permanent,
                ) {
                    flooded[[row, col]] = i16::from(is_flooded);
                }

                let mut clear = 0i16;
                let mut wet_intervals = 0i16;
                for (_, outcome) in intervals {
                    let composite = match outcome.as_composite() {
                        Some(c) => c,
                        None => continue,
                    };
                    if composite.valid_obs[[row, col]] == 0 {
                        continue;
                    }
                    clear += 1;
                    if ref_val.is_finite() {
                        let call = self.classify_pixel(
                            ref_val,
                            composite.index[[row, col]],
                            steep,
                            permanent,
                        );
                        if call == Some(true) {
                            wet_intervals += 1;
                        }
                    }
                }

                clear_views[[row, col]] = clear;
                if ref_val.is_finite() {
                    duration[[row, col]] = wet_intervals;
                }
                if total_intervals > 0 {
                    let perc =
                        (100.0 * f64::from(clear) / total_intervals as f64).round() as i16;
                    clear_perc[[row, col]] = perc.clamp(0, 100);
                }
            }
        }

        log::debug!(
            "Classified {}x{} pixels over {} sub-intervals",
            shape.0,
            shape.1,
            total_intervals
        );

        Ok(FloodMapRaster {
            grid: grid.clone(),
            flooded,
            duration,
            clear_views,
            clear_perc_scaled: clear_perc,
        })
    }
}

impl Default for FloodClassifier {
    fn default() -> Self {
        Self::new()
    }
}
