use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::core::classifier::{ClassifierParams, FloodClassifier, FloodMapRaster};
use crate::core::compositor::{CompositeRaster, CompositorParams, IndexCompositor};
use crate::core::quality::{assign_flags, FlagContext, QualityFlag, QualityThresholds};
use crate::core::zonal::{ZonalAggregator, ZonalMetrics, ZonalParams};
use crate::io::aux_masks::MaskProvider;
use crate::io::flood_map::FloodMapStore;
use crate::io::population::{PopulationError, PopulationSource};
use crate::io::scenes::SceneProvider;
use crate::types::{
    BoundingBox, CountImage, EventKey, EventRecord, FloodError, FloodResult, GridSpec, IndexImage,
};

/// End-to-end processing parameters for one batch
#[derive(Debug, Clone, Serialize)]
pub struct PipelineParams {
    /// Working-grid pixel size in degrees (default ~250 m at the equator)
    pub pixel_size_deg: f64,
    pub compositor: CompositorParams,
    pub classifier: ClassifierParams,
    pub zonal: ZonalParams,
    pub quality: QualityThresholds,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            pixel_size_deg: 0.00225,
            compositor: CompositorParams::default(),
            classifier: ClassifierParams::default(),
            zonal: ZonalParams::default(),
            quality: QualityThresholds::default(),
        }
    }
}

/// One event's metrics record, the unit consumed by downstream
/// consolidation
#[derive(Debug, Clone, Serialize)]
pub struct EventMetrics {
    pub key: EventKey,
    /// Inclusive event duration in days
    pub event_duration_days: i64,
    #[serde(flatten)]
    pub zonal: ZonalMetrics,
    pub flags: BTreeSet<QualityFlag>,
    /// Path of the persisted classification artifact, when a store is
    /// configured and the write succeeded
    pub artifact: Option<PathBuf>,
}

impl EventMetrics {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Terminal state of one event within a batch
#[derive(Debug, Clone, Serialize)]
pub enum EventStatus {
    /// Metrics produced with no data-quality caveats
    Succeeded,
    /// Metrics produced, but at least one quality flag records a known
    /// limitation (allocation-method flags alone do not count)
    CompletedWithFlags,
    /// No metrics; the reason is recorded and sibling events are unaffected
    Failed(String),
}

/// Per-event result row of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub key: EventKey,
    pub status: EventStatus,
    pub metrics: Option<EventMetrics>,
}

fn status_for(flags: &BTreeSet<QualityFlag>) -> EventStatus {
    let caveats = flags.iter().any(|&f| {
        !matches!(
            f,
            QualityFlag::ImpactsSplitByPopulation | QualityFlag::ImpactsDirectlyReported
        )
    });
    if caveats {
        EventStatus::CompletedWithFlags
    } else {
        EventStatus::Succeeded
    }
}

/// Processes one event end-to-end: composites, classification, artifact
/// persistence, zonal aggregation, and quality flags.
///
/// Holds only shared read-only collaborators, so one processor is shared by
/// reference across all batch workers.
pub struct EventProcessor<'a> {
    provider: &'a dyn SceneProvider,
    masks: &'a dyn MaskProvider,
    population: &'a dyn PopulationSource,
    store: Option<&'a FloodMapStore>,
    params: PipelineParams,
}

impl<'a> EventProcessor<'a> {
    pub fn new(
        provider: &'a dyn SceneProvider,
        masks: &'a dyn MaskProvider,
        population: &'a dyn PopulationSource,
        params: PipelineParams,
    ) -> Self {
        Self {
            provider,
            masks,
            population,
            store: None,
            params,
        }
    }

    /// Persist classification artifacts to this store as events complete
    pub fn with_store(mut self, store: &'a FloodMapStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Composite standing in for a period with no usable coverage
    fn nan_composite(grid: &GridSpec) -> CompositeRaster {
        let shape = grid.shape();
        CompositeRaster {
            grid: grid.clone(),
            index: IndexImage::from_elem(shape, f32::NAN),
            valid_obs: CountImage::zeros(shape),
        }
    }

    pub fn process(&self, record: &EventRecord) -> FloodResult<EventMetrics> {
        record.validate()?;
        log::info!(
            "Processing event {} ({} to {})",
            record.key,
            record.start_date,
            record.end_date
        );

        let bbox = BoundingBox::from_polygon(&record.polygon).ok_or_else(|| {
            FloodError::InvalidInput(format!("event {}: polygon has no extent", record.key))
        })?;
        let grid = GridSpec::from_bbox(&bbox, self.params.pixel_size_deg)?;

        // Reference and event composites. No-coverage periods degrade to an
        // all-NaN composite: the classifier then emits no-data calls while
        // observation accounting still reflects the event window.
        let compositor =
            IndexCompositor::with_params(self.provider, self.params.compositor.clone());
        let (ref_start, ref_end) = compositor.reference_window(record.start_date);
        let reference = compositor.composite(&grid, ref_start, ref_end)?;
        let series = compositor.event_series(&grid, record.start_date, record.end_date)?;

        let reference = match reference.as_composite() {
            Some(c) => c.clone(),
            None => {
                log::warn!("Event {}: no reference coverage", record.key);
                Self::nan_composite(&grid)
            }
        };
        let event = match series.overall.as_composite() {
            Some(c) => c.clone(),
            None => {
                log::warn!("Event {}: no event-window coverage", record.key);
                Self::nan_composite(&grid)
            }
        };

        let masks = self.masks.masks(&grid)?;
        let classifier = FloodClassifier::with_params(self.params.classifier.clone());
        let map = classifier.classify(&reference, &event, &series.intervals, &masks)?;

        let (artifact, flood_map_available) = self.persist(&record.key, &map);

        // Population gaps become quality flags, not failures; area metrics
        // are still produced
        let (density, population_available, grid_mismatch) =
            match self.population.density(&grid) {
                Ok(d) => (Some(d), true, false),
                Err(PopulationError::Missing(msg)) => {
                    log::warn!("Event {}: {}", record.key, msg);
                    (None, false, false)
                }
                Err(PopulationError::Mismatched(msg)) => {
                    log::warn!("Event {}: {}", record.key, msg);
                    (None, true, true)
                }
                Err(PopulationError::Other(e)) => return Err(e),
            };

        let aggregator = ZonalAggregator::with_params(self.params.zonal.clone());
        let zonal = aggregator.aggregate(&map, &record.polygon, density.as_ref())?;

        let ctx = FlagContext {
            start_day_estimated: record.start_day_estimated,
            end_day_estimated: record.end_day_estimated,
            start_date: Some(record.start_date),
            end_date: Some(record.end_date),
            has_admin_units: true,
            processed: true,
            allocation: Some(record.allocation),
            flood_map_available,
            population_available,
            grid_mismatch,
            record_country: record.country.clone(),
            boundary_country: record.boundary_country.clone(),
            adm1_code: record.key.adm1_code,
            flooded_area_km2: Some(zonal.flooded_area_km2),
            clear_fraction: zonal.clear_fraction,
            no_valid_pixels: zonal.no_usable_imagery,
        };
        let flags = assign_flags(&ctx, &self.params.quality);

        log::info!(
            "Event {}: area {:.3} km2, population {:.0}, flags [{}]",
            record.key,
            zonal.flooded_area_km2,
            zonal.flooded_population,
            flags
                .iter()
                .map(|f| f.id().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(EventMetrics {
            key: record.key.clone(),
            event_duration_days: record.duration_days(),
            zonal,
            flags,
            artifact,
        })
    }

    /// Write the artifact when a store is configured. Write failures degrade
    /// to flag 4 rather than failing the event: the in-memory metrics are
    /// still sound.
    fn persist(&self, key: &EventKey, map: &FloodMapRaster) -> (Option<PathBuf>, bool) {
        match self.store {
            None => (None, true),
            Some(store) => match store.write(key, map) {
                Ok(path) => (Some(path), true),
                Err(e) => {
                    log::warn!("Event {}: failed to persist flood map: {}", key, e);
                    (None, false)
                }
            },
        }
    }
}

/// Summary statistics for one admin1 unit across a batch
#[derive(Debug, Clone, Serialize)]
pub struct Admin1Summary {
    pub adm1_code: i64,
    /// All events referencing the unit, including flagged ones
    pub event_count: usize,
    /// Means exclude zero-flooded-area events and zero/undefined values
    pub mean_flooded_population: Option<f64>,
    pub mean_flooded_area_km2: Option<f64>,
    pub mean_flooded_area_norm: Option<f64>,
}

/// Result of one batch run: every input event appears exactly once, as a
/// metrics record or a recorded failure
#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub completed_with_flags: usize,
    pub failed: usize,
    /// Events carrying each flag id
    pub flag_counts: BTreeMap<u8, usize>,
    pub outcomes: Vec<EventOutcome>,
}

impl BatchSummary {
    fn from_outcomes(outcomes: Vec<EventOutcome>) -> Self {
        let mut succeeded = 0;
        let mut completed_with_flags = 0;
        let mut failed = 0;
        let mut flag_counts: BTreeMap<u8, usize> = BTreeMap::new();

        for outcome in &outcomes {
            match &outcome.status {
                EventStatus::Succeeded => succeeded += 1,
                EventStatus::CompletedWithFlags => completed_with_flags += 1,
                EventStatus::Failed(_) => failed += 1,
            }
            if let Some(metrics) = &outcome.metrics {
                for flag in &metrics.flags {
                    *flag_counts.entry(flag.id()).or_insert(0) += 1;
                }
            }
        }

        Self {
            total: outcomes.len(),
            succeeded,
            completed_with_flags,
            failed,
            flag_counts,
            outcomes,
        }
    }

    /// Per-admin1 mean impact statistics, mirroring the downstream summary
    /// table: counts cover all events, means exclude zero-area events.
    pub fn admin1_summaries(&self) -> Vec<Admin1Summary> {
        let mut by_code: BTreeMap<i64, Vec<&EventMetrics>> = BTreeMap::new();
        for outcome in &self.outcomes {
            if let Some(metrics) = &outcome.metrics {
                by_code.entry(metrics.key.adm1_code).or_default().push(metrics);
            }
        }

        by_code
            .into_iter()
            .map(|(adm1_code, events)| {
                let event_count = events.len();
                let usable: Vec<&&EventMetrics> = events
                    .iter()
                    .filter(|m| {
                        !m.flags.contains(&QualityFlag::ZeroFloodedArea)
                            && m.zonal.flooded_population > 0.0
                            && m.zonal.flooded_area_km2 > 0.0
                            && m.zonal.flooded_area_norm > 0.0
                    })
                    .collect();
                let mean = |f: fn(&ZonalMetrics) -> f64| {
                    if usable.is_empty() {
                        None
                    } else {
                        Some(usable.iter().map(|m| f(&m.zonal)).sum::<f64>() / usable.len() as f64)
                    }
                };
                Admin1Summary {
                    adm1_code,
                    event_count,
                    mean_flooded_population: mean(|z| z.flooded_population),
                    mean_flooded_area_km2: mean(|z| z.flooded_area_km2),
                    mean_flooded_area_norm: mean(|z| z.flooded_area_norm),
                }
            })
            .collect()
    }
}

/// Drives per-event processing through a bounded worker pool.
///
/// Events are independent: workers share only the read-only providers held
/// by the processor. A failure stays local to its event; the batch always
/// runs to completion once configuration has been validated.
pub struct BatchRunner {
    workers: usize,
}

impl BatchRunner {
    /// Worker count is tunable to respect provider rate limits
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn run(
        &self,
        processor: &EventProcessor<'_>,
        records: &[EventRecord],
    ) -> FloodResult<BatchSummary> {
        log::info!(
            "Starting batch of {} events on {} workers",
            records.len(),
            self.workers
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| FloodError::Processing(format!("failed to build worker pool: {}", e)))?;

        let outcomes: Vec<EventOutcome> = pool.install(|| {
            records
                .par_iter()
                .map(|record| match processor.process(record) {
                    Ok(metrics) => EventOutcome {
                        key: record.key.clone(),
                        status: status_for(&metrics.flags),
                        metrics: Some(metrics),
                    },
                    Err(e) => {
                        log::error!("Event {} failed: {}", record.key, e);
                        EventOutcome {
                            key: record.key.clone(),
                            status: EventStatus::Failed(e.to_string()),
                            metrics: None,
                        }
                    }
                })
                .collect()
        });

        let summary = BatchSummary::from_outcomes(outcomes);
        log::info!(
            "Batch complete: {} succeeded, {} with flags, {} failed of {}",
            summary.succeeded,
            summary.completed_with_flags,
            summary.failed,
            summary.total
        );
        for (id, count) in &summary.flag_counts {
            log::info!("  flag {}: {} events", id, count);
        }
        Ok(summary)
    }
}
