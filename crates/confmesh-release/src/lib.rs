//! confmesh-release — release-signal propagation cache.
//!
//! Tracks the latest "release changed" signal per namespace channel key in
//! memory, healing gaps in push delivery by backfilling from durable
//! storage. The long-poll endpoint answers client polls from this cache
//! instead of hitting the store on every request.
//!
//! # Components
//!
//! - **`source`** — the `MessageSource` seam over durable storage
//! - **`cache`** — the cache itself: merge, backfill, warm-up, scanner

pub mod cache;
pub mod source;

pub use cache::{RELEASE_CHANNEL, ReleaseMessageCache};
pub use source::MessageSource;
