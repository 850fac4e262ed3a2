//! Decode stage - turns fetched bytes into an image.

use crate::pipeline::context::ImageDecoding;
use crate::pipeline::error::PipelineError;
use crate::processing::ImageContainer;
use crate::request::DecodingHints;
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::debug;

/// Decodes `data` with `hints` on the blocking thread pool.
pub async fn decode_stage(
    decoder: Arc<dyn ImageDecoding>,
    data: Bytes,
    hints: DecodingHints,
) -> Result<ImageContainer, PipelineError> {
    let size_bytes = data.len();

    let image = spawn_blocking(move || decoder.decode(&data, &hints))
        .await
        .map_err(|e| PipelineError::Internal(format!("decode task panicked: {}", e)))??;

    debug!(
        size_bytes,
        width = image.width(),
        height = image.height(),
        "Decode stage complete"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::adapters::{ImageCrateDecoder, PngEncoder};
    use crate::pipeline::context::ImageEncoding;
    use image::DynamicImage;

    fn png(width: u32, height: u32) -> Bytes {
        PngEncoder
            .encode(&ImageContainer::new(DynamicImage::new_rgb8(width, height)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_decode_stage_success() {
        let image = decode_stage(
            Arc::new(ImageCrateDecoder),
            png(8, 4),
            DecodingHints::default(),
        )
        .await
        .unwrap();

        assert_eq!((image.width(), image.height()), (8, 4));
    }

    #[tokio::test]
    async fn test_decode_stage_applies_thumbnail_hint() {
        let image = decode_stage(
            Arc::new(ImageCrateDecoder),
            png(64, 32),
            DecodingHints::thumbnail(16),
        )
        .await
        .unwrap();

        assert!(image.width() <= 16 && image.height() <= 16);
    }

    #[tokio::test]
    async fn test_decode_stage_invalid_data() {
        let result = decode_stage(
            Arc::new(ImageCrateDecoder),
            Bytes::from_static(b"not an image"),
            DecodingHints::default(),
        )
        .await;

        assert!(matches!(result, Err(PipelineError::Decode(_))));
    }
}
