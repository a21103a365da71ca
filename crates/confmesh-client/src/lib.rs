//! confmesh-client — client-side config cache and change notifications.
//!
//! A client process holds, per namespace, the last-known property snapshot
//! synchronized from an upstream source (remote poll endpoint or local
//! file). On every effective change the snapshot is swapped wholesale and
//! a typed change event (added/modified/deleted) is fanned out to
//! registered listeners on per-listener worker tasks, so a slow or
//! failing listener never stalls the publisher or its peers.
//!
//! # Components
//!
//! - **`types`** — snapshot and change-event types
//! - **`source`** — the `ConfigSource` upstream seam and `FileSource`
//! - **`repository`** — `LocalRepository`: serialized sync, last-good retention
//! - **`file_cache`** — `ConfigFileCache`: typed content, classification,
//!   async listener dispatch

pub mod error;
pub mod file_cache;
pub mod repository;
pub mod source;
pub mod types;

pub use error::{ClientError, ClientResult};
pub use file_cache::{ConfigFileCache, ConfigFileChangeListener};
pub use repository::{LocalRepository, RepositoryChangeListener};
pub use source::{ConfigSource, FileSource};
pub use types::{ChangeType, ConfigFileChangeEvent, ConfigSourceType, Properties};
