//! Fetch stage - streams raw bytes from the data loader.

use crate::pipeline::context::{DataLoader, FetchError, FetchOptions};
use crate::pipeline::error::PipelineError;
use crate::pipeline::task::Progress;
use crate::request::DataKey;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::debug;

/// Upper bound on the buffer reserved from a loader's advertised length.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Fetches the full body for `key`, reporting progress per chunk.
///
/// An empty body is an error. Dropping the returned future drops the
/// loader's future or stream, cancelling the fetch.
pub async fn fetch_stage<P>(
    loader: &dyn DataLoader,
    key: &DataKey,
    on_progress: P,
) -> Result<Bytes, PipelineError>
where
    P: Fn(Progress),
{
    let options = FetchOptions {
        reload_ignoring_cached_data: key.reload_ignoring_cached_data,
    };
    let response = loader.fetch(&key.locator, options).await?;
    let total = response.expected_len;
    let mut body = response.body;

    let capacity = total.and_then(|len| usize::try_from(len.min(MAX_PREALLOCATION)).ok());
    let mut buffer = match capacity {
        Some(capacity) => BytesMut::with_capacity(capacity),
        None => BytesMut::new(),
    };
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);
        on_progress(Progress::new(buffer.len() as u64, total));
    }

    if buffer.is_empty() {
        return Err(FetchError::new("response body is empty").into());
    }

    debug!(
        locator = %key.locator,
        size_bytes = buffer.len(),
        "Fetch stage complete"
    );
    Ok(buffer.freeze())
}
