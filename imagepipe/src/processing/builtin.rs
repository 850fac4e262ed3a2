//! Built-in processing steps backed by the `image` crate.

use super::{ImageContainer, ImageProcessor, ProcessingError, ProcessorId};
use image::imageops::FilterType;
use std::sync::Arc;

/// Resizes to exactly `width` x `height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl ImageProcessor for Resize {
    fn identifier(&self) -> ProcessorId {
        ProcessorId::new("resize")
            .with_parameter("width", self.width)
            .with_parameter("height", self.height)
    }

    fn apply(&self, input: &ImageContainer) -> Result<ImageContainer, ProcessingError> {
        if self.width == 0 || self.height == 0 {
            return Err(ProcessingError::new(format!(
                "invalid target size {}x{}",
                self.width, self.height
            )));
        }
        let resized = input
            .image()
            .resize_exact(self.width, self.height, FilterType::Triangle);
        Ok(ImageContainer::new(resized))
    }
}

/// Converts to 8-bit luma.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Grayscale;

impl ImageProcessor for Grayscale {
    fn identifier(&self) -> ProcessorId {
        ProcessorId::new("grayscale")
    }

    fn apply(&self, input: &ImageContainer) -> Result<ImageContainer, ProcessingError> {
        Ok(ImageContainer::new(input.image().grayscale()))
    }
}

/// Gaussian blur with the given standard deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianBlur {
    pub sigma: f32,
}

impl GaussianBlur {
    pub fn new(sigma: f32) -> Self {
        Self { sigma }
    }
}

impl ImageProcessor for GaussianBlur {
    fn identifier(&self) -> ProcessorId {
        ProcessorId::new("gaussian_blur").with_parameter("sigma", self.sigma)
    }

    fn apply(&self, input: &ImageContainer) -> Result<ImageContainer, ProcessingError> {
        if !self.sigma.is_finite() || self.sigma <= 0.0 {
            return Err(ProcessingError::new(format!("invalid sigma {}", self.sigma)));
        }
        Ok(ImageContainer::new(input.image().blur(self.sigma)))
    }
}

type ProcessFn = dyn Fn(&ImageContainer) -> Result<ImageContainer, ProcessingError> + Send + Sync;

/// A closure-backed step with a caller-chosen identifier.
///
/// The caller is responsible for keeping the identifier unique per behavior.
#[derive(Clone)]
pub struct Anonymous {
    id: ProcessorId,
    function: Arc<ProcessFn>,
}

impl Anonymous {
    pub fn new<F>(id: impl Into<String>, function: F) -> Self
    where
        F: Fn(&ImageContainer) -> Result<ImageContainer, ProcessingError> + Send + Sync + 'static,
    {
        Self {
            id: ProcessorId::new(id),
            function: Arc::new(function),
        }
    }
}

impl ImageProcessor for Anonymous {
    fn identifier(&self) -> ProcessorId {
        self.id.clone()
    }

    fn apply(&self, input: &ImageContainer) -> Result<ImageContainer, ProcessingError> {
        (self.function)(input)
    }
}

impl std::fmt::Debug for Anonymous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anonymous").field("id", &self.id).finish()
    }
}
