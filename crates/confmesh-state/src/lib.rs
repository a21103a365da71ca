//! confmesh-state — embedded config store for confmesh.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for release messages, gray-release rules, clusters, namespaces,
//! releases, release history, audit records, and namespace locks.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Records with storage-assigned ids live in `u64`-keyed tables so id-ordered
//! range scans are cheap; clusters and namespaces use composite string keys
//! (`{app_id}/{name}`, `{app_id}/{cluster}/{namespace}`) for prefix scans.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
