//! Image requests and the equivalence keys derived from them.
//!
//! A [`ImageRequest`] is immutable value data. Whether two requests can share
//! work is decided exclusively by the keys in [`keys`], never by identity:
//!
//! ```text
//! DataKey        locator + fetch options               → fetch stage
//! LoadKey        DataKey + decoding hints              → decode stage
//! ProcessingKey  LoadKey + first k processor ids       → process stage k
//! Full key       ProcessingKey(n), or LoadKey if n = 0 → result caches
//! ```

mod keys;
mod types;

pub use keys::{DataKey, ImageIdentity, LoadKey, ProcessingKey, RequestKeys, ResultKey};
pub use types::{
    CachePolicy, DecodingHints, ImageRequest, Locator, Priority, RequestOptions, ThumbnailOptions,
};
