//! I/O modules: imagery providers, auxiliary rasters, persisted artifacts

pub mod aux_masks;
pub mod flood_map;
pub mod population;
pub mod remote;
pub mod scenes;

pub use aux_masks::{AuxMaskProvider, MaskParams, MaskProvider, MaskSet, TerrainSource};
pub use flood_map::{read_flood_map, FloodMapStore};
pub use population::{GeoTiffPopulation, InMemoryPopulation, PopulationError, PopulationSource};
pub use remote::{HttpSceneProvider, RemoteSceneConfig};
pub use scenes::{
    ExportBackedProvider, ExportBackend, JobStatus, PollConfig, RetryPolicy, RetryingProvider,
    Scene, SceneProvider, SceneQuery,
};
