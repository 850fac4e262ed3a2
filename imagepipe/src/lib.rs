//! imagepipe - request-coalescing image loading and processing.
//!
//! Fetches images through a pluggable loader, decodes them and runs them
//! through chains of processors, sharing every intermediate step between
//! concurrent requests that need it.
//!
//! # Modules
//!
//! - [`request`] - requests, priorities, cache policies and derived keys
//! - [`processing`] - processor trait, image container and built-in steps
//! - [`pipeline`] - the coalescing engine and task handles
//! - [`cache`] - reference memory and disk result caches
//! - [`logging`] - tracing setup

pub mod cache;
pub mod logging;
pub mod pipeline;
pub mod processing;
pub mod request;

pub use pipeline::{
    CacheType, ImagePipeline, ImageResponse, ImageTask, PipelineConfig, PipelineContext,
    PipelineError, Progress, TaskState,
};
pub use processing::{ImageContainer, ImageProcessor, ProcessorId};
pub use request::{CachePolicy, ImageRequest, Locator, Priority};

/// Version of the imagepipe library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
