//! Core flood classification and aggregation modules

pub mod batch;
pub mod classifier;
pub mod compositor;
pub mod quality;
pub mod zonal;

// Re-export main types
pub use batch::{
    Admin1Summary, BatchRunner, BatchSummary, EventMetrics, EventOutcome, EventProcessor,
    EventStatus, PipelineParams,
};
pub use classifier::{ClassifierParams, FloodClassifier, FloodMapRaster};
pub use compositor::{
    CompositeOutcome, CompositeRaster, CompositorParams, EventSeries, IndexCompositor,
    SubInterval,
};
pub use quality::{assign_flags, FlagContext, FlagSpec, QualityFlag, QualityThresholds, SCHEMA};
pub use zonal::{ZonalAggregator, ZonalMetrics, ZonalParams};
