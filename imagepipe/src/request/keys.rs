//! Key derivation for coalescing and caching.
//!
//! Keys are structural values compared by equality. Derivation is pure and
//! runs for every submitted request, possibly from many threads at once.

use super::types::{DecodingHints, ImageRequest, Locator};
use crate::processing::ProcessorId;
use std::fmt;
use std::sync::Arc;

/// Key of the fetch stage: everything that changes what the data loader does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataKey {
    pub locator: Locator,
    pub reload_ignoring_cached_data: bool,
}

/// Cache identity of a decoded original image.
///
/// Fetch-only options such as `reload_ignoring_cached_data` are left out so
/// a reloaded image replaces the cached one instead of living beside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageIdentity {
    pub locator: Locator,
    pub decoding: DecodingHints,
}

/// Key of the decode stage.
///
/// Ignores the processing chain, the priority and the cache skip flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadKey {
    pub data: DataKey,
    pub decoding: DecodingHints,
}

impl LoadKey {
    /// Returns the cache identity of the decoded image.
    pub fn identity(&self) -> ImageIdentity {
        ImageIdentity {
            locator: self.data.locator.clone(),
            decoding: self.decoding,
        }
    }

    /// Returns the result-cache key for the unprocessed image.
    pub fn result_key(&self) -> ResultKey {
        ResultKey {
            image: self.identity(),
            steps: Arc::from(Vec::new()),
        }
    }
}

/// Key of processing stage `k`: the load key plus the first `k` steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessingKey {
    pub load: LoadKey,
    pub steps: Arc<[ProcessorId]>,
}

impl ProcessingKey {
    /// Number of processing steps covered by this key.
    #[inline]
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// Returns the result-cache key for this prefix.
    pub fn result_key(&self) -> ResultKey {
        ResultKey {
            image: self.load.identity(),
            steps: Arc::clone(&self.steps),
        }
    }
}

/// Key under which results are stored in the memory and disk caches.
///
/// An empty `steps` slice identifies the decoded original.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub image: ImageIdentity,
    pub steps: Arc<[ProcessorId]>,
}

impl ResultKey {
    /// Number of processing steps covered by this key.
    #[inline]
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// Stable textual form used by persistent caches.
    ///
    /// Equal keys always render identically, across processes, and distinct
    /// keys never do: the locator and every step are length-prefixed, so no
    /// choice of locator or identifier text can imitate another key.
    pub fn stable_string(&self) -> String {
        let mut out = String::new();
        push_component(&mut out, self.image.locator.as_str());
        match self.image.decoding.thumbnail {
            Some(thumbnail) => out.push_str(&format!(";t{}", thumbnail.max_pixel_size)),
            None => out.push_str(";-"),
        }
        out.push_str(&format!(";{}", self.steps.len()));
        for step in self.steps.iter() {
            out.push(';');
            push_component(&mut out, &step.to_string());
        }
        out
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.image.locator)?;
        if let Some(thumbnail) = self.image.decoding.thumbnail {
            write!(f, "#thumbnail={}", thumbnail.max_pixel_size)?;
        }
        for step in self.steps.iter() {
            write!(f, "|{}", step)?;
        }
        Ok(())
    }
}

fn push_component(out: &mut String, text: &str) {
    out.push_str(&format!("{}:{}", text.len(), text));
}

/// Every key derived from a single request.
#[derive(Debug, Clone)]
pub struct RequestKeys {
    pub data: DataKey,
    pub load: LoadKey,
    /// One key per prefix length; `processing[k - 1]` covers `k` steps.
    pub processing: Vec<ProcessingKey>,
}

impl RequestKeys {
    /// Derives all keys for a request.
    pub fn derive(request: &ImageRequest) -> Self {
        let data = DataKey {
            locator: request.locator().clone(),
            reload_ignoring_cached_data: request.cache_policy().reload_ignoring_cached_data,
        };
        let load = LoadKey {
            data: data.clone(),
            decoding: request.options().decoding,
        };

        let ids = request.processor_ids();
        let processing = (1..=ids.len())
            .map(|k| ProcessingKey {
                load: load.clone(),
                steps: Arc::from(&ids[..k]),
            })
            .collect();

        Self {
            data,
            load,
            processing,
        }
    }

    /// Length of the processing chain.
    #[inline]
    pub fn depth(&self) -> usize {
        self.processing.len()
    }

    /// Processing key for prefix length `k` (1-based).
    pub fn processing_key(&self, k: usize) -> Option<&ProcessingKey> {
        k.checked_sub(1).and_then(|i| self.processing.get(i))
    }

    /// Result-cache key for prefix length `k`; `0` is the decoded original.
    pub fn result_key(&self, k: usize) -> Option<ResultKey> {
        if k == 0 {
            Some(self.load.result_key())
        } else {
            self.processing_key(k).map(ProcessingKey::result_key)
        }
    }

    /// Result-cache form of the full key.
    pub fn full_result_key(&self) -> ResultKey {
        match self.processing.last() {
            Some(key) => key.result_key(),
            None => self.load.result_key(),
        }
    }
}
