//! In-memory caching of query results.
//!
//! Every query category is served from its own [`Cacher`], keyed by a [`CacheKey`] built from the
//! normalized query parameters.

mod cache_key;
mod memory;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use memory::{CacheEntry, CacheRequest, CacheStats, Cacher, MaybeStale};
