//! Image containers and processing steps.
//!
//! A processing step is a trait object exposing an [`ImageProcessor::identifier`]
//! (name plus parameters) and an [`ImageProcessor::apply`] function. The
//! identifier is what processing keys are built from, so `apply` must be a
//! pure function of it.

mod builtin;

pub use builtin::{Anonymous, GaussianBlur, Grayscale, Resize};

use image::DynamicImage;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Declared identity of a processing step.
///
/// Two processors with equal identifiers are treated as interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId {
    name: String,
    parameters: Vec<(String, String)>,
}

impl ProcessorId {
    /// Creates an identifier without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    /// Appends a parameter. Parameters keep their declaration order.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.parameters.push((key.into(), value.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.parameters.is_empty() {
            return Ok(());
        }
        f.write_str("(")?;
        for (i, (key, value)) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        f.write_str(")")
    }
}

/// Error reported by a processing function.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProcessingError {
    pub message: String,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A single step of a processing chain.
///
/// Implementations run on the blocking thread pool and may take a while.
pub trait ImageProcessor: Send + Sync + 'static {
    /// Name and parameters of this step.
    fn identifier(&self) -> ProcessorId;

    /// Applies the step to an image.
    fn apply(&self, input: &ImageContainer) -> Result<ImageContainer, ProcessingError>;
}

/// A decoded image flowing between pipeline stages.
///
/// Cloning is cheap; the pixel buffer is shared.
#[derive(Clone)]
pub struct ImageContainer {
    image: Arc<DynamicImage>,
}

impl ImageContainer {
    /// Wraps a decoded image.
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Approximate in-memory cost, used to weigh cache entries.
    pub fn byte_size(&self) -> usize {
        self.image.as_bytes().len()
    }
}

impl fmt::Debug for ImageContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageContainer")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.image.color())
            .finish()
    }
}
