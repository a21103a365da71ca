//! LocalRepository — last-known snapshot for one namespace.
//!
//! The repository syncs a property snapshot from its upstream source and
//! keeps the last-good copy through transient failures. Sync is
//! serialized per repository instance so downstream listeners observe a
//! consistent, non-interleaved sequence of snapshots.

use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::error::ClientResult;
use crate::source::ConfigSource;
use crate::types::{ConfigSourceType, Properties};

/// Invoked when the repository's snapshot changes.
pub trait RepositoryChangeListener: Send + Sync {
    /// Called with the namespace and the new snapshot after an effective
    /// change. Delivery is synchronous and in registration order.
    fn on_repository_change(&self, namespace: &str, new_properties: &Properties);
}

/// Client-side holder of the last-known snapshot for one namespace.
pub struct LocalRepository {
    namespace: String,
    source: Arc<dyn ConfigSource>,
    /// Serializes the fetch-compare-swap-notify sequence.
    sync_lock: Mutex<()>,
    cached: RwLock<Option<Properties>>,
    source_type: RwLock<ConfigSourceType>,
    listeners: Mutex<Vec<Arc<dyn RepositoryChangeListener>>>,
}

impl LocalRepository {
    /// Create a repository and attempt one synchronous sync. A failed
    /// initial sync is logged and swallowed; the repository starts with
    /// no snapshot and `source_type() == None` until a sync succeeds.
    pub fn new(namespace: impl Into<String>, source: Arc<dyn ConfigSource>) -> Self {
        let repository = Self {
            namespace: namespace.into(),
            source,
            sync_lock: Mutex::new(()),
            cached: RwLock::new(None),
            source_type: RwLock::new(ConfigSourceType::None),
            listeners: Mutex::new(Vec::new()),
        };
        repository.try_sync();
        repository
    }

    /// The namespace this repository holds.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Where the current snapshot came from; `None` until the first
    /// successful sync.
    pub fn source_type(&self) -> ConfigSourceType {
        *self.source_type.read().expect("repository lock poisoned")
    }

    /// The current snapshot, syncing first if none is held yet.
    pub fn get_config(&self) -> Option<Properties> {
        if self.cached.read().expect("repository lock poisoned").is_none() {
            self.try_sync();
        }
        self.cached.read().expect("repository lock poisoned").clone()
    }

    /// Sync from upstream. Returns whether the snapshot changed; a failed
    /// fetch propagates and leaves the last-good snapshot in place.
    pub fn sync(&self) -> ClientResult<bool> {
        let _guard = self.sync_lock.lock().expect("repository lock poisoned");

        let fresh = self.source.fetch()?;
        {
            let cached = self.cached.read().expect("repository lock poisoned");
            if cached.as_ref() == Some(&fresh) {
                return Ok(false);
            }
        }

        *self.cached.write().expect("repository lock poisoned") = Some(fresh.clone());
        *self.source_type.write().expect("repository lock poisoned") = self.source.source_type();
        debug!(namespace = %self.namespace, keys = fresh.len(), "repository snapshot updated");

        self.fire_repository_change(&fresh);
        Ok(true)
    }

    /// Sync from upstream, logging instead of propagating failure.
    /// Returns whether the snapshot changed.
    pub fn try_sync(&self) -> bool {
        match self.sync() {
            Ok(changed) => changed,
            Err(e) => {
                warn!(
                    namespace = %self.namespace,
                    error = %e,
                    "sync failed, keeping last-good snapshot"
                );
                false
            }
        }
    }

    /// Register a change listener. Adding the same listener twice is a
    /// no-op.
    pub fn add_change_listener(&self, listener: Arc<dyn RepositoryChangeListener>) {
        let mut listeners = self.listeners.lock().expect("repository lock poisoned");
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a change listener. Returns whether it was registered.
    pub fn remove_change_listener(&self, listener: &Arc<dyn RepositoryChangeListener>) -> bool {
        let mut listeners = self.listeners.lock().expect("repository lock poisoned");
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Notify listeners of a new snapshot. The listener set is snapshotted
    /// so registration changes during a pass don't affect it.
    fn fire_repository_change(&self, new_properties: &Properties) {
        let snapshot: Vec<_> = self
            .listeners
            .lock()
            .expect("repository lock poisoned")
            .clone();
        for listener in snapshot {
            listener.on_repository_change(&self.namespace, new_properties);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

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
    }

    impl ConfigSource for FakeSource {
        fn fetch(&self) -> ClientResult<Properties> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(crate::error::ClientError::Source(
                    "upstream unavailable".to_string(),
                ));
            }
            Ok(self.properties.lock().unwrap().clone())
        }

        fn source_type(&self) -> ConfigSourceType {
            ConfigSourceType::Remote
        }
    }

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<Properties>>,
    }

    impl RepositoryChangeListener for Recorder {
        fn on_repository_change(&self, _namespace: &str, new_properties: &Properties) {
            self.snapshots.lock().unwrap().push(new_properties.clone());
        }
    }

    #[test]
    fn initial_sync_populates_snapshot() {
        let source = Arc::new(FakeSource::default());
        source.set("timeout", "100");

        let repository = LocalRepository::new("application", source);

        assert_eq!(repository.source_type(), ConfigSourceType::Remote);
        let config = repository.get_config().unwrap();
        assert_eq!(config.get("timeout").unwrap(), "100");
    }

    #[test]
    fn failed_initial_sync_is_tolerated_and_recovers() {
        let source = Arc::new(FakeSource::default());
        source.fail.store(true, Ordering::SeqCst);

        let repository = LocalRepository::new("application", source.clone());
        assert_eq!(repository.source_type(), ConfigSourceType::None);
        assert!(repository.get_config().is_none());

        // Upstream comes back; the next sync recovers.
        source.fail.store(false, Ordering::SeqCst);
        source.set("timeout", "100");
        assert!(repository.try_sync());
        assert_eq!(repository.source_type(), ConfigSourceType::Remote);
        assert!(repository.get_config().is_some());
    }

    #[test]
    fn failed_sync_keeps_last_good_snapshot() {
        let source = Arc::new(FakeSource::default());
        source.set("timeout", "100");
        let repository = LocalRepository::new("application", source.clone());

        source.fail.store(true, Ordering::SeqCst);
        assert!(repository.sync().is_err());

        let config = repository.get_config().unwrap();
        assert_eq!(config.get("timeout").unwrap(), "100");
        assert_eq!(repository.source_type(), ConfigSourceType::Remote);
    }

    #[test]
    fn equal_snapshot_does_not_notify() {
        let source = Arc::new(FakeSource::default());
        source.set("timeout", "100");
        let repository = LocalRepository::new("application", source.clone());

        let recorder = Arc::new(Recorder::default());
        repository.add_change_listener(recorder.clone());

        assert!(!repository.try_sync());
        assert!(recorder.snapshots.lock().unwrap().is_empty());

        source.set("timeout", "200");
        assert!(repository.try_sync());
        assert_eq!(recorder.snapshots.lock().unwrap().len(), 1);
    }

    #[test]
    fn add_listener_is_idempotent() {
        let source = Arc::new(FakeSource::default());
        let repository = LocalRepository::new("application", source.clone());

        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn RepositoryChangeListener> = recorder.clone();
        repository.add_change_listener(as_listener.clone());
        repository.add_change_listener(as_listener.clone());

        source.set("timeout", "100");
        repository.try_sync();
        assert_eq!(recorder.snapshots.lock().unwrap().len(), 1);

        assert!(repository.remove_change_listener(&as_listener));
        assert!(!repository.remove_change_listener(&as_listener));
        source.set("timeout", "200");
        repository.try_sync();
        assert_eq!(recorder.snapshots.lock().unwrap().len(), 1);
    }
}
