//! Process stage - applies one processor to its input image.

use crate::pipeline::error::PipelineError;
use crate::processing::{ImageContainer, ImageProcessor};
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::debug;

/// Runs `processor` over `input` on the blocking thread pool.
pub async fn process_stage(
    processor: Arc<dyn ImageProcessor>,
    input: ImageContainer,
) -> Result<ImageContainer, PipelineError> {
    let processor_id = processor.identifier();

    let output = spawn_blocking(move || processor.apply(&input))
        .await
        .map_err(|e| PipelineError::Internal(format!("processing task panicked: {}", e)))?
        .map_err(|e| PipelineError::Processing {
            processor: processor_id.to_string(),
            message: e.message,
        })?;

    debug!(
        processor = %processor_id,
        width = output.width(),
        height = output.height(),
        "Process stage complete"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{Anonymous, ProcessingError, Resize};
    use image::DynamicImage;

    fn input() -> ImageContainer {
        ImageContainer::new(DynamicImage::new_rgb8(10, 10))
    }

    #[tokio::test]
    async fn test_process_stage_success() {
        let output = process_stage(Arc::new(Resize::new(4, 2)), input())
            .await
            .unwrap();
        assert_eq!((output.width(), output.height()), (4, 2));
    }

    #[tokio::test]
    async fn test_process_stage_failure_names_processor() {
        let failing = Anonymous::new("explode", |_: &ImageContainer| {
            Err(ProcessingError::new("boom"))
        });

        match process_stage(Arc::new(failing), input()).await {
            Err(PipelineError::Processing { processor, message }) => {
                assert_eq!(processor, "explode");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
