//! StateStore — redb-backed persistence for confmesh.
//!
//! Provides typed CRUD operations over release messages, gray-release
//! rules, clusters, namespaces, releases, release history, audits, and
//! namespace locks. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).
//!
//! Ids are assigned by the store: id-keyed tables use dense `last + 1`
//! ids so "id greater than watermark" range scans see every row exactly
//! once, while clusters and namespaces draw from a shared entity id
//! sequence so their ids can be cross-referenced (parent cluster, lock,
//! audit target).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RELEASE_MESSAGES).map_err(map_err!(Table))?;
        txn.open_table(GRAY_RULES).map_err(map_err!(Table))?;
        txn.open_table(RELEASES).map_err(map_err!(Table))?;
        txn.open_table(RELEASE_HISTORY).map_err(map_err!(Table))?;
        txn.open_table(AUDITS).map_err(map_err!(Table))?;
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
        txn.open_table(NAMESPACE_LOCKS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Draw `count` ids from the entity id sequence inside `txn`, returning
    /// the first one.
    fn next_entity_ids(txn: &WriteTransaction, count: u64) -> StateResult<u64> {
        let mut table = txn.open_table(META).map_err(map_err!(Table))?;
        let current = table
            .get(ENTITY_ID_SEQ)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        table
            .insert(ENTITY_ID_SEQ, current + count)
            .map_err(map_err!(Write))?;
        Ok(current + 1)
    }

    // ── Release messages ───────────────────────────────────────────

    /// Append a release change signal for the given channel key.
    ///
    /// The assigned id is `last + 1`, so ids are dense and monotonic.
    pub fn append_release_message(&self, message: &str) -> StateResult<ReleaseMessage> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let msg;
        {
            let mut table = txn.open_table(RELEASE_MESSAGES).map_err(map_err!(Table))?;
            let id = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            msg = ReleaseMessage {
                id,
                message: message.to_string(),
                created_at: epoch_secs(),
            };
            let value = serde_json::to_vec(&msg).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = msg.id, message = %msg.message, "release message appended");
        Ok(msg)
    }

    /// Read up to `limit` release messages with id strictly greater than
    /// `greater_than`, ordered ascending by id.
    pub fn release_messages_after(
        &self,
        greater_than: u64,
        limit: usize,
    ) -> StateResult<Vec<ReleaseMessage>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASE_MESSAGES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(greater_than.saturating_add(1)..)
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let msg: ReleaseMessage =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(msg);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    // ── Gray-release rules ─────────────────────────────────────────

    /// Get the active (highest-id live) rule record for a branch tuple.
    pub fn latest_gray_rule(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
        branch_name: &str,
    ) -> StateResult<Option<GrayReleaseRule>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GRAY_RULES).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rule: GrayReleaseRule =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if rule.app_id == app_id
                && rule.cluster_name == cluster_name
                && rule.namespace_name == namespace_name
                && rule.branch_name == branch_name
            {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    /// Persist `new_rule` (id assigned by the store) and remove the record
    /// with `old_id`, both inside one write transaction. Either both land
    /// or neither does, so readers never observe two "current" records.
    pub fn replace_gray_rule(
        &self,
        mut new_rule: GrayReleaseRule,
        old_id: Option<u64>,
    ) -> StateResult<GrayReleaseRule> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GRAY_RULES).map_err(map_err!(Table))?;
            new_rule.id = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            let value = serde_json::to_vec(&new_rule).map_err(map_err!(Serialize))?;
            table
                .insert(new_rule.id, value.as_slice())
                .map_err(map_err!(Write))?;
            if let Some(old) = old_id {
                table.remove(old).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            id = new_rule.id,
            replaced = ?old_id,
            branch = %new_rule.branch_name,
            "gray rule replaced"
        );
        Ok(new_rule)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Persist a cluster. The entity id is assigned by the store.
    pub fn save_cluster(&self, mut cluster: Cluster) -> StateResult<Cluster> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        cluster.id = Self::next_entity_ids(&txn, 1)?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let key = cluster.table_key();
            let value = serde_json::to_vec(&cluster).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(cluster)
    }

    /// Get a cluster by app id and name.
    pub fn find_cluster(&self, app_id: &str, name: &str) -> StateResult<Option<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table
            .get(cluster_key(app_id, name).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                let cluster: Cluster =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cluster))
            }
            None => Ok(None),
        }
    }

    /// Find the child (branch) cluster of a parent, if one exists.
    pub fn child_cluster_of(&self, parent_cluster_id: u64) -> StateResult<Option<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let cluster: Cluster =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if cluster.parent_cluster_id == parent_cluster_id {
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    /// Persist a branch cluster together with its namespace inside one
    /// write transaction, so partial creation is never observable.
    pub fn create_branch_records(
        &self,
        mut cluster: Cluster,
        mut namespace: Namespace,
    ) -> StateResult<(Cluster, Namespace)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let first = Self::next_entity_ids(&txn, 2)?;
        cluster.id = first;
        namespace.id = first + 1;
        namespace.cluster_name = cluster.name.clone();
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let key = cluster.table_key();
            let value = serde_json::to_vec(&cluster).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        {
            let mut table = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            let key = namespace.table_key();
            let value = serde_json::to_vec(&namespace).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            cluster = %cluster.name,
            namespace = %namespace.namespace_name,
            "branch records created"
        );
        Ok((cluster, namespace))
    }

    /// Delete a cluster and every namespace under it inside one write
    /// transaction. Returns the removed cluster, if it existed.
    pub fn delete_cluster_cascade(
        &self,
        app_id: &str,
        name: &str,
    ) -> StateResult<Option<Cluster>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            removed = match table
                .remove(cluster_key(app_id, name).as_str())
                .map_err(map_err!(Write))?
            {
                Some(guard) => Some(
                    serde_json::from_slice::<Cluster>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
        }
        if removed.is_some() {
            let prefix = format!("{app_id}/{name}/");
            let mut table = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app_id, %name, existed = removed.is_some(), "cluster deleted");
        Ok(removed)
    }

    // ── Namespaces ─────────────────────────────────────────────────

    /// Persist a namespace. The entity id is assigned by the store.
    pub fn save_namespace(&self, mut namespace: Namespace) -> StateResult<Namespace> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        namespace.id = Self::next_entity_ids(&txn, 1)?;
        {
            let mut table = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            let key = namespace.table_key();
            let value = serde_json::to_vec(&namespace).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(namespace)
    }

    /// Get a namespace by its identifying triple.
    pub fn find_namespace(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
    ) -> StateResult<Option<Namespace>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
        match table
            .get(namespace_key(app_id, cluster_name, namespace_name).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                let ns: Namespace =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(ns))
            }
            None => Ok(None),
        }
    }

    // ── Releases ───────────────────────────────────────────────────

    /// Persist a release. Id and timestamp are assigned by the store.
    pub fn save_release(&self, mut release: Release) -> StateResult<Release> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            release.id = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            release.created_at = epoch_secs();
            let value = serde_json::to_vec(&release).map_err(map_err!(Serialize))?;
            table
                .insert(release.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(release)
    }

    /// Mark a release abandoned. Returns true if it existed.
    pub fn abandon_release(&self, id: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            let release = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    let mut r: Release = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    r.abandoned = true;
                    Some(r)
                }
                None => None,
            };
            existed = release.is_some();
            if let Some(r) = release {
                let value = serde_json::to_vec(&r).map_err(map_err!(Serialize))?;
                table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Get the newest non-abandoned release for a namespace.
    pub fn find_latest_active_release(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
    ) -> StateResult<Option<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let release: Release =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !release.abandoned
                && release.app_id == app_id
                && release.cluster_name == cluster_name
                && release.namespace_name == namespace_name
            {
                return Ok(Some(release));
            }
        }
        Ok(None)
    }

    // ── Release history & audit ────────────────────────────────────

    /// Append a release history entry. Id and timestamp assigned by the store.
    pub fn append_release_history(&self, mut entry: ReleaseHistory) -> StateResult<ReleaseHistory> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RELEASE_HISTORY).map_err(map_err!(Table))?;
            entry.id = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            entry.created_at = epoch_secs();
            let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            table
                .insert(entry.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(entry)
    }

    /// List all release history entries, ascending by id.
    pub fn list_release_history(&self) -> StateResult<Vec<ReleaseHistory>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASE_HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let history: ReleaseHistory =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(history);
        }
        Ok(results)
    }

    /// Append an audit record for an entity mutation.
    pub fn append_audit(
        &self,
        entity_name: &str,
        entity_id: u64,
        operation: AuditOp,
        operator: &str,
    ) -> StateResult<Audit> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let audit;
        {
            let mut table = txn.open_table(AUDITS).map_err(map_err!(Table))?;
            let id = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            audit = Audit {
                id,
                entity_name: entity_name.to_string(),
                entity_id,
                operation,
                operator: operator.to_string(),
                created_at: epoch_secs(),
            };
            let value = serde_json::to_vec(&audit).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(audit)
    }

    /// List all audit records, ascending by id.
    pub fn list_audits(&self) -> StateResult<Vec<Audit>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDITS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let audit: Audit =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(audit);
        }
        Ok(results)
    }

    // ── Namespace locks ────────────────────────────────────────────

    /// Try to acquire the edit lock on a namespace. Returns true if the
    /// lock was acquired (or already held by the same operator).
    pub fn try_lock_namespace(&self, namespace_id: u64, operator: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(NAMESPACE_LOCKS).map_err(map_err!(Table))?;
            let existing = match table.get(namespace_id).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<NamespaceLock>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            match existing {
                Some(lock) => acquired = lock.locked_by == operator,
                None => {
                    let lock = NamespaceLock {
                        namespace_id,
                        locked_by: operator.to_string(),
                    };
                    let value = serde_json::to_vec(&lock).map_err(map_err!(Serialize))?;
                    table
                        .insert(namespace_id, value.as_slice())
                        .map_err(map_err!(Write))?;
                    acquired = true;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acquired)
    }

    /// Get the current lock on a namespace, if any.
    pub fn namespace_lock(&self, namespace_id: u64) -> StateResult<Option<NamespaceLock>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NAMESPACE_LOCKS).map_err(map_err!(Table))?;
        match table.get(namespace_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let lock: NamespaceLock =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lock))
            }
            None => Ok(None),
        }
    }

    /// Release the lock on a namespace. Returns true if one was held.
    pub fn unlock_namespace(&self, namespace_id: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NAMESPACE_LOCKS).map_err(map_err!(Table))?;
            existed = table.remove(namespace_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
