//! Request-coalescing image pipeline.
//!
//! Requests flow through up to three kinds of stages: fetch, decode and one
//! process stage per processing step. Every stage execution is a shared
//! work unit, keyed so that equivalent work is done once no matter how many
//! requests need it:
//!
//! | Stage   | Key             | Shared between requests with equal |
//! |---------|-----------------|------------------------------------|
//! | fetch   | `DataKey`       | locator and reload flag            |
//! | decode  | `LoadKey`       | ... and decoding hints             |
//! | process | `ProcessingKey` | ... and processor prefix           |
//!
//! Each request's own priority and lifetime flow through a task handle
//! ([`ImageTask`]) into the units it depends on.
//!
//! # Example
//!
//! ```ignore
//! let pipeline = ImagePipeline::new(PipelineConfig::default(), PipelineContext::new(loader))?;
//! let request = ImageRequest::new("https://example.com/a.png")
//!     .with_processor(Resize::new(64, 64))
//!     .with_priority(Priority::High);
//! let response = pipeline.load(request).await?;
//! ```

pub mod adapters;
mod coalesce;
mod config;
mod context;
mod engine;
mod error;
mod scheduler;
mod stages;
mod task;
mod work_unit;

pub use coalesce::{CoalescerStats, CoalescingRegistry};
pub use config::{
    default_cpu_concurrency, CacheLookupPolicy, PipelineConfig, DEFAULT_MAX_CONCURRENT_FETCHES,
    FALLBACK_CPU_CONCURRENCY,
};
pub use context::{
    DataLoader, DataResponse, DecodeError, DiskCache, EncodeError, FetchError, FetchOptions,
    ImageDecoding, ImageEncoding, PipelineContext, ResultCache,
};
pub use engine::{ImagePipeline, PipelineStats};
pub use error::PipelineError;
pub use scheduler::{StagePermit, StageScheduler};
pub use stages::{decode_stage, fetch_stage, process_stage, ResultCacheWriter};
pub use task::{CacheType, ImageResponse, ImageTask, Progress, TaskId, TaskResult, TaskState};
pub use work_unit::{CommitPolicy, StageKind, StageResult, SubscriberId, UnitState, WorkUnit};
