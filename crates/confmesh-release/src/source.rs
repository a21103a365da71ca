//! The storage seam for the release-message cache.

use confmesh_state::{ReleaseMessage, StateResult, StateStore};

/// Source of release messages for cache backfill.
///
/// Implementations must return messages with id strictly greater than
/// `greater_than`, ordered ascending by id, at most `limit` at a time.
/// Ids are assumed monotonically assigned with read-your-writes
/// consistency for this process.
pub trait MessageSource: Send + Sync {
    /// Read the next batch of release messages after the given id.
    fn messages_after(&self, greater_than: u64, limit: usize) -> StateResult<Vec<ReleaseMessage>>;
}

impl MessageSource for StateStore {
    fn messages_after(&self, greater_than: u64, limit: usize) -> StateResult<Vec<ReleaseMessage>> {
        self.release_messages_after(greater_than, limit)
    }
}
