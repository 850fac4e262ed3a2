//! Decoder and encoder adapters for the `image` crate.

use crate::pipeline::context::{DecodeError, EncodeError, ImageDecoding, ImageEncoding};
use crate::processing::ImageContainer;
use crate::request::DecodingHints;
use bytes::Bytes;
use image::ImageFormat;
use std::io::Cursor;

/// Decodes any format the `image` crate was built with.
///
/// Honors thumbnail hints by downscaling, preserving aspect ratio. Images
/// already within the requested size are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoding for ImageCrateDecoder {
    fn decode(&self, data: &[u8], hints: &DecodingHints) -> Result<ImageContainer, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::new("empty image data"));
        }
        let mut image =
            image::load_from_memory(data).map_err(|e| DecodeError::new(e.to_string()))?;

        if let Some(thumbnail) = hints.thumbnail {
            let size = thumbnail.max_pixel_size.max(1);
            if image.width() > size || image.height() > size {
                image = image.thumbnail(size, size);
            }
        }

        Ok(ImageContainer::new(image))
    }
}

/// Encodes images as PNG for the disk cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngEncoder;

impl ImageEncoding for PngEncoder {
    fn encode(&self, image: &ImageContainer) -> Result<Bytes, EncodeError> {
        let mut buffer = Cursor::new(Vec::new());
        image
            .image()
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| EncodeError::new(e.to_string()))?;
        Ok(Bytes::from(buffer.into_inner()))
    }
}
