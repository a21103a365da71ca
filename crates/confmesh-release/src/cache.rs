//! ReleaseMessageCache — latest release signal per channel key.
//!
//! The cache holds, for every channel key, the highest-id release message
//! seen so far, plus a watermark (`max_id_scanned`) for the highest id
//! fully accounted for. Push delivery takes the fast path when the
//! incoming id is contiguous with the watermark; a gap triggers a paged
//! backfill from storage. Until push delivery is confirmed, a background
//! scanner heals gaps on a fixed interval; the first push permanently
//! disables it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use confmesh_state::{ReleaseMessage, StateResult};

use crate::source::MessageSource;

/// Pub/sub channel carrying release change signals. Messages on any other
/// channel are ignored by the cache.
pub const RELEASE_CHANNEL: &str = "config.release";

/// Rows fetched per backfill page.
const BACKFILL_PAGE: usize = 500;

/// Cache state guarded by one lock: merges are check-then-act on both the
/// per-key entry and the watermark, so they must be atomic together.
struct Inner {
    /// Per channel key, the highest-id message seen.
    entries: HashMap<String, ReleaseMessage>,
    /// Highest id fully merged into the cache. Non-decreasing.
    max_id_scanned: u64,
}

/// In-memory cache of the latest release message per channel key.
///
/// Reads (`find_latest*`) proceed concurrently with writes and may observe
/// a slightly stale snapshot; the cached id for a key never decreases.
pub struct ReleaseMessageCache {
    source: Arc<dyn MessageSource>,
    inner: RwLock<Inner>,
    /// One-way flag: cleared on the first push notification, never re-set.
    scan_enabled: AtomicBool,
    /// Set once the startup backfill has completed.
    initialized: AtomicBool,
}

impl ReleaseMessageCache {
    /// Create an empty cache over the given message source.
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self {
            source,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                max_id_scanned: 0,
            }),
            scan_enabled: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
        }
    }

    /// Synchronously load every release message from storage into the
    /// cache. Must complete before the cache is handed to callers; this is
    /// the one intentional blocking load in the process lifecycle.
    pub fn warm_up(&self) -> StateResult<()> {
        let loaded = self.backfill(0)?;
        self.initialized.store(true, Ordering::Release);
        info!(loaded, watermark = self.watermark(), "release message cache warmed up");
        Ok(())
    }

    /// True once the startup load has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Highest id fully merged into the cache.
    pub fn watermark(&self) -> u64 {
        self.inner.read().expect("cache lock poisoned").max_id_scanned
    }

    /// Among the cached entries for the given keys, the one with the
    /// maximum id.
    pub fn find_latest(&self, keys: &[&str]) -> Option<ReleaseMessage> {
        let inner = self.inner.read().expect("cache lock poisoned");
        keys.iter()
            .filter_map(|key| inner.entries.get(*key))
            .max_by_key(|msg| msg.id)
            .cloned()
    }

    /// The cached entry per key, omitting keys with no entry. Order is
    /// unspecified.
    pub fn find_latest_per_key(&self, keys: &[&str]) -> Vec<ReleaseMessage> {
        let inner = self.inner.read().expect("cache lock poisoned");
        keys.iter()
            .filter_map(|key| inner.entries.get(*key))
            .cloned()
            .collect()
    }

    /// Handle a release message delivered by the pub/sub transport.
    ///
    /// Delivery is at-least-once, possibly out of order, possibly gapped.
    /// A contiguous id merges directly without touching storage; a gap
    /// triggers a full backfill from the watermark, with storage errors
    /// surfaced to the caller. Stale and duplicate ids are no-ops.
    pub fn on_message_published(&self, msg: &ReleaseMessage, channel: &str) -> StateResult<()> {
        // Push delivery is live; the poll-based healer is no longer needed.
        self.scan_enabled.store(false, Ordering::Release);

        if channel != RELEASE_CHANNEL || msg.message.is_empty() {
            debug!(%channel, id = msg.id, "ignoring message for foreign channel or empty key");
            return Ok(());
        }

        let watermark = self.watermark();
        if msg.id == watermark + 1 {
            self.merge(msg);
        } else if msg.id > watermark {
            warn!(id = msg.id, watermark, "gap in release messages, backfilling");
            self.backfill(watermark)?;
        }
        // msg.id <= watermark: stale or duplicate delivery, nothing to do.
        Ok(())
    }

    /// Merge one message: replace the entry for its key and advance the
    /// watermark, only if no entry exists or the id is strictly greater.
    /// Idempotent and order-tolerant.
    fn merge(&self, msg: &ReleaseMessage) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        let replace = inner
            .entries
            .get(&msg.message)
            .is_none_or(|old| msg.id > old.id);
        if replace {
            inner.entries.insert(msg.message.clone(), msg.clone());
            inner.max_id_scanned = inner.max_id_scanned.max(msg.id);
        }
    }

    /// Read messages with id greater than `from` in pages, merging each,
    /// until a short page signals no more data. Returns the number of rows
    /// merged. The watermark only advances past rows that actually merged,
    /// so a failed page leaves the cache consistent.
    fn backfill(&self, from: u64) -> StateResult<usize> {
        let mut cursor = from;
        let mut total = 0;
        loop {
            let batch = self.source.messages_after(cursor, BACKFILL_PAGE)?;
            if batch.is_empty() {
                break;
            }
            for msg in &batch {
                self.merge(msg);
            }
            total += batch.len();
            cursor = batch[batch.len() - 1].id;
            debug!(loaded = batch.len(), cursor, "backfilled release messages");
            if batch.len() < BACKFILL_PAGE {
                break;
            }
        }
        Ok(total)
    }

    /// Spawn the periodic backfill scanner.
    ///
    /// Each tick re-backfills from the current watermark to heal any gap
    /// in push delivery. The task exits when the shutdown channel fires or
    /// when the first push notification disables scanning; storage errors
    /// are logged and retried on the next tick.
    pub fn spawn_scanner(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(interval = ?interval, "release message scanner starting");
            loop {
                if !self.scan_enabled.load(Ordering::Acquire) {
                    info!("push delivery confirmed, release message scanner disabled");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if !self.scan_enabled.load(Ordering::Acquire) {
                            info!("push delivery confirmed, release message scanner disabled");
                            break;
                        }
                        let from = self.watermark();
                        if let Err(e) = self.backfill(from) {
                            error!(error = %e, from, "scan for new release messages failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("release message scanner shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confmesh_state::StateError;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// In-memory message source with a failure switch and a read counter.
    #[derive(Default)]
    struct FakeSource {
        messages: Mutex<Vec<ReleaseMessage>>,
        reads: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakeSource {
        fn push(&self, id: u64, key: &str) {
            self.messages.lock().unwrap().push(msg(id, key));
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl MessageSource for FakeSource {
        fn messages_after(
            &self,
            greater_than: u64,
            limit: usize,
        ) -> StateResult<Vec<ReleaseMessage>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StateError::Read("storage unavailable".to_string()));
            }
            let mut rows: Vec<ReleaseMessage> = self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.id > greater_than)
                .cloned()
                .collect();
            rows.sort_by_key(|m| m.id);
            rows.truncate(limit);
            Ok(rows)
        }
    }

    fn msg(id: u64, key: &str) -> ReleaseMessage {
        ReleaseMessage {
            id,
            message: key.to_string(),
            created_at: 0,
        }
    }

    fn cache_over(source: Arc<FakeSource>) -> ReleaseMessageCache {
        ReleaseMessageCache::new(source)
    }

    // ── Merge semantics ────────────────────────────────────────────

    #[test]
    fn merge_is_monotonic_regardless_of_delivery_order() {
        let cache = cache_over(Arc::new(FakeSource::default()));

        for id in [5u64, 3, 7, 6] {
            cache.merge(&msg(id, "app+default+application"));
        }

        let latest = cache.find_latest(&["app+default+application"]).unwrap();
        assert_eq!(latest.id, 7);
        assert_eq!(cache.watermark(), 7);
    }

    #[test]
    fn merge_is_idempotent() {
        let cache = cache_over(Arc::new(FakeSource::default()));

        cache.merge(&msg(4, "app+default+application"));
        cache.merge(&msg(4, "app+default+application"));

        assert_eq!(cache.find_latest_per_key(&["app+default+application"]).len(), 1);
        assert_eq!(cache.watermark(), 4);
    }

    #[test]
    fn find_latest_picks_max_across_keys() {
        let cache = cache_over(Arc::new(FakeSource::default()));
        cache.merge(&msg(1, "a"));
        cache.merge(&msg(3, "b"));
        cache.merge(&msg(2, "c"));

        assert_eq!(cache.find_latest(&["a", "b", "c"]).unwrap().id, 3);
        assert_eq!(cache.find_latest(&["a", "c"]).unwrap().id, 2);
        assert!(cache.find_latest(&["nope"]).is_none());
        assert!(cache.find_latest(&[]).is_none());
    }

    #[test]
    fn find_latest_per_key_omits_missing() {
        let cache = cache_over(Arc::new(FakeSource::default()));
        cache.merge(&msg(1, "a"));
        cache.merge(&msg(2, "b"));

        let mut ids: Vec<u64> = cache
            .find_latest_per_key(&["a", "b", "missing"])
            .iter()
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    // ── Warm-up & backfill ─────────────────────────────────────────

    #[test]
    fn warm_up_loads_everything_and_marks_initialized() {
        let source = Arc::new(FakeSource::default());
        for id in 1..=10 {
            source.push(id, &format!("key-{}", id % 3));
        }
        let cache = cache_over(source.clone());

        assert!(!cache.is_initialized());
        cache.warm_up().unwrap();
        assert!(cache.is_initialized());
        assert_eq!(cache.watermark(), 10);
        // Three distinct keys, each holding its newest id.
        assert_eq!(cache.find_latest_per_key(&["key-0", "key-1", "key-2"]).len(), 3);
    }

    #[test]
    fn backfill_pages_through_large_backlog() {
        let source = Arc::new(FakeSource::default());
        for id in 1..=1200 {
            source.push(id, &format!("key-{}", id % 7));
        }
        let cache = cache_over(source.clone());

        cache.warm_up().unwrap();

        assert_eq!(cache.watermark(), 1200);
        // Two full pages plus one short page.
        assert_eq!(source.reads(), 3);
    }

    #[test]
    fn warm_up_failure_leaves_cache_uninitialized() {
        let source = Arc::new(FakeSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let cache = cache_over(source.clone());

        assert!(cache.warm_up().is_err());
        assert!(!cache.is_initialized());
        assert_eq!(cache.watermark(), 0);
    }

    // ── Push handling ──────────────────────────────────────────────

    #[test]
    fn contiguous_push_merges_without_storage_read() {
        let source = Arc::new(FakeSource::default());
        for id in 1..=10 {
            source.push(id, "app+default+application");
        }
        let cache = cache_over(source.clone());
        cache.warm_up().unwrap();
        let reads_after_warm_up = source.reads();

        cache
            .on_message_published(&msg(11, "app+default+db"), RELEASE_CHANNEL)
            .unwrap();

        assert_eq!(source.reads(), reads_after_warm_up);
        assert_eq!(cache.watermark(), 11);
        assert_eq!(cache.find_latest(&["app+default+db"]).unwrap().id, 11);
    }

    #[test]
    fn gap_triggers_backfill_from_watermark() {
        let source = Arc::new(FakeSource::default());
        for id in 1..=10 {
            source.push(id, "app+default+application");
        }
        let cache = cache_over(source.clone());
        cache.warm_up().unwrap();
        assert_eq!(cache.watermark(), 10);

        // Ids 11..13 land in storage but only 13 is pushed.
        source.push(11, "key-11");
        source.push(12, "key-12");
        source.push(13, "key-13");
        cache
            .on_message_published(&msg(13, "key-13"), RELEASE_CHANNEL)
            .unwrap();

        assert_eq!(cache.watermark(), 13);
        assert_eq!(cache.find_latest_per_key(&["key-11", "key-12", "key-13"]).len(), 3);
    }

    #[test]
    fn stale_and_duplicate_pushes_are_no_ops() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_over(source.clone());
        cache.merge(&msg(5, "a"));
        let reads = source.reads();

        cache.on_message_published(&msg(5, "a"), RELEASE_CHANNEL).unwrap();
        cache.on_message_published(&msg(3, "a"), RELEASE_CHANNEL).unwrap();

        assert_eq!(cache.watermark(), 5);
        assert_eq!(cache.find_latest(&["a"]).unwrap().id, 5);
        assert_eq!(source.reads(), reads);
    }

    #[test]
    fn foreign_channel_and_empty_key_are_ignored() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_over(source.clone());

        cache.on_message_published(&msg(1, "a"), "other.topic").unwrap();
        cache.on_message_published(&msg(1, ""), RELEASE_CHANNEL).unwrap();

        assert_eq!(cache.watermark(), 0);
        assert!(cache.find_latest(&["a"]).is_none());
    }

    #[test]
    fn gap_backfill_surfaces_storage_error_without_corrupting_watermark() {
        let source = Arc::new(FakeSource::default());
        source.push(1, "a");
        let cache = cache_over(source.clone());
        cache.warm_up().unwrap();

        source.fail.store(true, Ordering::SeqCst);
        let result = cache.on_message_published(&msg(3, "b"), RELEASE_CHANNEL);

        assert!(result.is_err());
        assert_eq!(cache.watermark(), 1);

        // Recovery: the next gap push backfills cleanly.
        source.fail.store(false, Ordering::SeqCst);
        source.push(2, "b");
        source.push(3, "c");
        cache.on_message_published(&msg(3, "c"), RELEASE_CHANNEL).unwrap();
        assert_eq!(cache.watermark(), 3);
    }

    // ── Scanner ────────────────────────────────────────────────────

    /// Sleep-based wait so the paused clock keeps auto-advancing: a busy
    /// yield loop would keep the runtime ready and freeze virtual time.
    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_heals_gaps_until_push_confirms_delivery() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(cache_over(source.clone()));
        cache.warm_up().unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = cache.clone().spawn_scanner(Duration::from_secs(1), shutdown_rx);

        // The scanner polls storage and picks up rows written behind
        // the cache's back.
        source.push(1, "a");
        let c = cache.clone();
        wait_for(move || c.watermark() == 1).await;

        // First push disables the scanner for good.
        cache.on_message_published(&msg(2, "b"), RELEASE_CHANNEL).unwrap();
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("scanner did not stop after push")
            .unwrap();

        let reads_after_stop = source.reads();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.reads(), reads_after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_retries_after_storage_error() {
        let source = Arc::new(FakeSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(cache_over(source.clone()));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _handle = cache.clone().spawn_scanner(Duration::from_secs(1), shutdown_rx);

        // At least two failed attempts prove the retry loop.
        let s = source.clone();
        wait_for(move || s.reads() >= 2).await;

        source.fail.store(false, Ordering::SeqCst);
        source.push(1, "a");
        let c = cache.clone();
        wait_for(move || c.watermark() == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_stops_on_shutdown_signal() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(cache_over(source.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = cache.clone().spawn_scanner(Duration::from_secs(1), shutdown_rx);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("scanner did not stop on shutdown")
            .unwrap();
    }
}
