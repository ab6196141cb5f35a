//! Training and evaluation of pose-guided and attribute-guided person image
//! synthesis models.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod image_pool;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod pipelines;
pub mod scheduler;
pub mod trainer;
pub mod visualization;

pub use checkpoint::{CheckpointManifest, CheckpointStore};
pub use config::{PipelineKind, TrainingConfig, TrainingError};
pub use data::{Batch, DataLoader, Split};
pub use metrics::Errors;
pub use pipelines::{build_pipeline, ExecutionPlan, Pipeline};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::Trainer;
