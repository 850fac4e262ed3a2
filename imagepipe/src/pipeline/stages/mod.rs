//! Stage implementations.
//!
//! Each stage is a plain async function that does one unit of work; the
//! engine decides when to run them, shares them between requests and
//! routes their results. CPU-bound stages run on the blocking thread pool.

mod cache;
mod decode;
mod fetch;
mod process;

pub use cache::ResultCacheWriter;
pub use decode::decode_stage;
pub use fetch::fetch_stage;
pub use process::process_stage;
