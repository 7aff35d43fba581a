//! inundata: A Fast, Modular Flood Extent and Impact Processor
//!
//! This library derives per-event flood extent, duration, and impact metrics
//! from multi-temporal satellite reflectance imagery: cloud-aware index
//! composites for a reference and an event period, per-pixel flood
//! classification corrected for terrain and permanent water, and
//! population-weighted zonal statistics per administrative unit, with
//! deterministic data-quality flags on every result.

pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use crate::types::{
    AllocationMethod, BandImage, BoolMask, BoundingBox, CountImage, EventKey, EventRecord,
    FloodError, FloodResult, GeoTransform, GridSpec, IndexImage, ProviderError, BAND_NODATA,
};

pub use crate::core::{
    assign_flags, BatchRunner, BatchSummary, ClassifierParams, CompositeOutcome, CompositeRaster,
    CompositorParams, EventMetrics, EventOutcome, EventProcessor, EventStatus, FlagContext,
    FloodClassifier, FloodMapRaster, IndexCompositor, PipelineParams, QualityFlag,
    QualityThresholds, ZonalAggregator, ZonalMetrics,
};

pub use crate::io::{
    AuxMaskProvider, FloodMapStore, MaskProvider, MaskSet, PopulationSource, RetryingProvider,
    Scene, SceneProvider, SceneQuery,
};
