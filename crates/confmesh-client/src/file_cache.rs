//! ConfigFileCache — typed config-file view with async change dispatch.
//!
//! Wraps a `LocalRepository`, renders its raw snapshot into config-file
//! content, classifies each effective change as added/modified/deleted,
//! and fans the resulting event out to registered listeners. Every
//! listener owns a FIFO queue drained by its own worker task, so events
//! reach each listener in fired order, a panicking listener cannot touch
//! its peers, and the publisher never blocks on a slow callback.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::repository::{LocalRepository, RepositoryChangeListener};
use crate::types::{ChangeType, ConfigFileChangeEvent, ConfigSourceType, Properties};

/// Receives one `ConfigFileChangeEvent` per effective change. The
/// callback runs on a worker task and must not be assumed complete
/// before the triggering update returns.
pub trait ConfigFileChangeListener: Send + Sync {
    /// Handle one change event.
    fn on_change(&self, event: &ConfigFileChangeEvent);
}

/// Per-listener dispatch state: the queue feeding the worker task.
struct ListenerSlot {
    listener: Arc<dyn ConfigFileChangeListener>,
    tx: mpsc::UnboundedSender<ConfigFileChangeEvent>,
    handle: JoinHandle<()>,
}

/// Typed config-file cache for one namespace.
pub struct ConfigFileCache {
    namespace: String,
    repository: Arc<LocalRepository>,
    /// Serializes the compare-swap-classify-dispatch sequence.
    update_lock: Mutex<()>,
    properties: RwLock<Option<Properties>>,
    source_type: RwLock<ConfigSourceType>,
    listeners: Mutex<Vec<ListenerSlot>>,
}

impl ConfigFileCache {
    /// Create a cache over a repository and register for its changes.
    ///
    /// The registration happens whether or not the repository holds a
    /// snapshot yet, so a repository recovering from a failed initial
    /// sync still reaches this cache.
    pub fn new(repository: Arc<LocalRepository>) -> Arc<Self> {
        let cache = Arc::new(Self {
            namespace: repository.namespace().to_string(),
            properties: RwLock::new(repository.get_config()),
            source_type: RwLock::new(repository.source_type()),
            repository: repository.clone(),
            update_lock: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
        });
        repository.add_change_listener(cache.clone());
        cache
    }

    /// The namespace this cache renders.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Where the current snapshot came from.
    pub fn source_type(&self) -> ConfigSourceType {
        *self.source_type.read().expect("file cache lock poisoned")
    }

    /// The current raw snapshot, if any.
    pub fn properties(&self) -> Option<Properties> {
        self.properties.read().expect("file cache lock poisoned").clone()
    }

    /// The rendered config-file content: one `key=value` line per
    /// property. `None` when no snapshot is held or the snapshot is
    /// empty.
    pub fn content(&self) -> Option<String> {
        let properties = self.properties.read().expect("file cache lock poisoned");
        render_content(properties.as_ref())
    }

    /// True if the cache currently renders non-empty content.
    pub fn has_content(&self) -> bool {
        self.content().is_some()
    }

    /// Register a change listener and spawn its dispatch worker. Adding
    /// the same listener twice is a no-op. Must be called from within a
    /// tokio runtime.
    pub fn add_change_listener(&self, listener: Arc<dyn ConfigFileChangeListener>) {
        let mut listeners = self.listeners.lock().expect("file cache lock poisoned");
        if listeners.iter().any(|slot| Arc::ptr_eq(&slot.listener, &listener)) {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ConfigFileChangeEvent>();
        let worker = listener.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| worker.on_change(&event)));
                if outcome.is_err() {
                    error!(
                        namespace = %event.namespace,
                        change_type = ?event.change_type,
                        "config file change listener panicked"
                    );
                }
            }
        });
        listeners.push(ListenerSlot { listener, tx, handle });
    }

    /// Remove a change listener. Its queue is closed; deliveries already
    /// enqueued still drain before the worker exits. Returns whether it
    /// was registered.
    pub fn remove_change_listener(&self, listener: &Arc<dyn ConfigFileChangeListener>) -> bool {
        let mut listeners = self.listeners.lock().expect("file cache lock poisoned");
        let before = listeners.len();
        listeners.retain(|slot| !Arc::ptr_eq(&slot.listener, listener));
        listeners.len() != before
    }

    /// Drop all listeners and abort their workers, abandoning un-started
    /// deliveries. Does not block.
    pub fn shutdown(&self) {
        let mut listeners = self.listeners.lock().expect("file cache lock poisoned");
        for slot in listeners.drain(..) {
            slot.handle.abort();
        }
        debug!(namespace = %self.namespace, "config file cache shut down");
    }

    /// Enqueue the event on every listener's queue. A queue whose worker
    /// has gone away is skipped.
    fn fire_change(&self, event: ConfigFileChangeEvent) {
        let listeners = self.listeners.lock().expect("file cache lock poisoned");
        for slot in listeners.iter() {
            if slot.tx.send(event.clone()).is_err() {
                debug!(namespace = %event.namespace, "listener worker gone, dropping delivery");
            }
        }
    }
}

impl RepositoryChangeListener for ConfigFileCache {
    fn on_repository_change(&self, _namespace: &str, new_properties: &Properties) {
        // Updates are applied one at a time, in delivery order, so old
        // and new content come from a consistent sequence.
        let _guard = self.update_lock.lock().expect("file cache lock poisoned");

        {
            let current = self.properties.read().expect("file cache lock poisoned");
            if current.as_ref() == Some(new_properties) {
                return;
            }
        }

        let old_value = self.content();
        *self.properties.write().expect("file cache lock poisoned") =
            Some(new_properties.clone());
        *self.source_type.write().expect("file cache lock poisoned") =
            self.repository.source_type();
        let new_value = self.content();

        let change_type = match (&old_value, &new_value) {
            (None, _) => ChangeType::Added,
            (_, None) => ChangeType::Deleted,
            _ => ChangeType::Modified,
        };
        debug!(
            namespace = %self.namespace,
            ?change_type,
            "config file changed"
        );
        self.fire_change(ConfigFileChangeEvent {
            namespace: self.namespace.clone(),
            old_value,
            new_value,
            change_type,
        });
    }
}

/// Render a snapshot as `key=value` lines; empty or absent snapshots
/// render as no content.
fn render_content(properties: Option<&Properties>) -> Option<String> {
    let properties = properties?;
    if properties.is_empty() {
        return None;
    }
    let mut content = String::new();
    for (key, value) in properties {
        content.push_str(key);
        content.push('=');
        content.push_str(value);
        content.push('\n');
    }
    Some(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, ClientResult};
    use crate::source::ConfigSource;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSource {
        properties: Mutex<Properties>,
        fail: AtomicBool,
    }

    impl FakeSource {
        fn set(&self, key: &str, value: &str) {
            self.properties
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }

        fn clear(&self) {
            self.properties.lock().unwrap().clear();
        }
    }

    impl ConfigSource for FakeSource {
        fn fetch(&self) -> ClientResult<Properties> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Source("upstream unavailable".to_string()));
            }
            Ok(self.properties.lock().unwrap().clone())
        }

        fn source_type(&self) -> ConfigSourceType {
            ConfigSourceType::Remote
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ConfigFileChangeEvent>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<ConfigFileChangeEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ConfigFileChangeListener for Recorder {
        fn on_change(&self, event: &ConfigFileChangeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    /// A listener that always panics in its callback.
    struct Panicky;

    impl ConfigFileChangeListener for Panicky {
        fn on_change(&self, _event: &ConfigFileChangeEvent) {
            panic!("listener exploded");
        }
    }

    fn pipeline(source: Arc<FakeSource>) -> (Arc<LocalRepository>, Arc<ConfigFileCache>) {
        let repository = Arc::new(LocalRepository::new("application", source));
        let cache = ConfigFileCache::new(repository.clone());
        (repository, cache)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Give worker tasks a chance to drain anything (erroneously) queued
    /// before asserting that nothing arrived.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    // ── Change classification ──────────────────────────────────────

    #[tokio::test]
    async fn first_content_is_added() {
        let source = Arc::new(FakeSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let (repository, cache) = pipeline(source.clone());

        let recorder = Arc::new(Recorder::default());
        cache.add_change_listener(recorder.clone());

        source.fail.store(false, Ordering::SeqCst);
        source.set("timeout", "100");
        repository.try_sync();

        let r = recorder.clone();
        wait_until(move || !r.events().is_empty()).await;

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Added);
        assert!(events[0].old_value.is_none());
        assert_eq!(events[0].new_value.as_deref(), Some("timeout=100\n"));
    }

    #[tokio::test]
    async fn changed_content_is_modified() {
        let source = Arc::new(FakeSource::default());
        source.set("timeout", "100");
        let (repository, cache) = pipeline(source.clone());

        let recorder = Arc::new(Recorder::default());
        cache.add_change_listener(recorder.clone());

        source.set("timeout", "200");
        repository.try_sync();

        let r = recorder.clone();
        wait_until(move || !r.events().is_empty()).await;

        let events = recorder.events();
        assert_eq!(events[0].change_type, ChangeType::Modified);
        assert_eq!(events[0].old_value.as_deref(), Some("timeout=100\n"));
        assert_eq!(events[0].new_value.as_deref(), Some("timeout=200\n"));
    }

    #[tokio::test]
    async fn emptied_content_is_deleted() {
        let source = Arc::new(FakeSource::default());
        source.set("timeout", "100");
        let (repository, cache) = pipeline(source.clone());

        let recorder = Arc::new(Recorder::default());
        cache.add_change_listener(recorder.clone());

        source.clear();
        repository.try_sync();

        let r = recorder.clone();
        wait_until(move || !r.events().is_empty()).await;

        let events = recorder.events();
        assert_eq!(events[0].change_type, ChangeType::Deleted);
        assert_eq!(events[0].old_value.as_deref(), Some("timeout=100\n"));
        assert!(events[0].new_value.is_none());
        assert!(!cache.has_content());
    }

    #[tokio::test]
    async fn equal_snapshot_fires_no_event() {
        let source = Arc::new(FakeSource::default());
        source.set("timeout", "100");
        let (_repository, cache) = pipeline(source.clone());

        let recorder = Arc::new(Recorder::default());
        cache.add_change_listener(recorder.clone());

        // Same value delivered again: the cache's own equality check
        // swallows it even if the repository were to re-notify.
        let same = source.properties.lock().unwrap().clone();
        cache.on_repository_change("application", &same);

        settle().await;
        assert!(recorder.events().is_empty());
    }

    // ── Listener dispatch ──────────────────────────────────────────

    #[tokio::test]
    async fn panicking_listener_does_not_affect_others() {
        let source = Arc::new(FakeSource::default());
        let (repository, cache) = pipeline(source.clone());

        cache.add_change_listener(Arc::new(Panicky));
        let recorder = Arc::new(Recorder::default());
        cache.add_change_listener(recorder.clone());

        for value in ["1", "2", "3"] {
            source.set("timeout", value);
            repository.try_sync();
        }

        let r = recorder.clone();
        wait_until(move || r.events().len() == 3).await;

        // Every event arrived, in fired order, despite the first
        // listener panicking on each delivery.
        let values: Vec<_> = recorder
            .events()
            .iter()
            .map(|e| e.new_value.clone().unwrap())
            .collect();
        assert_eq!(values, vec!["timeout=1\n", "timeout=2\n", "timeout=3\n"]);
    }

    #[tokio::test]
    async fn add_listener_is_idempotent() {
        let source = Arc::new(FakeSource::default());
        let (repository, cache) = pipeline(source.clone());

        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn ConfigFileChangeListener> = recorder.clone();
        cache.add_change_listener(as_listener.clone());
        cache.add_change_listener(as_listener.clone());

        source.set("timeout", "100");
        repository.try_sync();

        let r = recorder.clone();
        wait_until(move || !r.events().is_empty()).await;
        settle().await;
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn removed_listener_receives_nothing_further() {
        let source = Arc::new(FakeSource::default());
        let (repository, cache) = pipeline(source.clone());

        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn ConfigFileChangeListener> = recorder.clone();
        cache.add_change_listener(as_listener.clone());

        source.set("timeout", "100");
        repository.try_sync();
        let r = recorder.clone();
        wait_until(move || !r.events().is_empty()).await;

        assert!(cache.remove_change_listener(&as_listener));
        source.set("timeout", "200");
        repository.try_sync();

        settle().await;
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_dispatch() {
        let source = Arc::new(FakeSource::default());
        let (repository, cache) = pipeline(source.clone());

        let recorder = Arc::new(Recorder::default());
        cache.add_change_listener(recorder.clone());
        cache.shutdown();

        source.set("timeout", "100");
        repository.try_sync();

        settle().await;
        assert!(recorder.events().is_empty());
    }

    // ── End-to-end over a file source ──────────────────────────────

    #[tokio::test]
    async fn file_backed_pipeline_delivers_typed_events() {
        use crate::source::FileSource;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("application.properties");
        std::fs::write(&path, "timeout=100\n").unwrap();

        let repository = Arc::new(LocalRepository::new(
            "application",
            Arc::new(FileSource::new(&path)),
        ));
        let cache = ConfigFileCache::new(repository.clone());
        assert_eq!(cache.source_type(), ConfigSourceType::Local);
        assert_eq!(cache.content().as_deref(), Some("timeout=100\n"));

        let recorder = Arc::new(Recorder::default());
        cache.add_change_listener(recorder.clone());

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "timeout=250").unwrap();
        drop(file);
        repository.try_sync();

        let r = recorder.clone();
        wait_until(move || !r.events().is_empty()).await;

        let events = recorder.events();
        assert_eq!(events[0].change_type, ChangeType::Modified);
        assert_eq!(events[0].new_value.as_deref(), Some("timeout=250\n"));
    }
}
