//! Domain types for the confmesh state store.
//!
//! These types represent the persisted state of the configuration platform:
//! release change signals, gray-release rules, clusters and their branch
//! relation, namespaces, releases, and the history/audit trail. All types
//! are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Application identifier.
pub type AppId = String;

// ── Release messages ───────────────────────────────────────────────

/// A lightweight change signal: some namespace's effective configuration
/// changed. The payload is fetched separately; the signal only carries the
/// channel key and a storage-assigned, monotonically increasing id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseMessage {
    /// Storage-assigned id. For a fixed `message`, a higher id is newer.
    pub id: u64,
    /// Channel key identifying a namespace-release channel,
    /// e.g. `{app_id}+{cluster}+{namespace}`.
    pub message: String,
    /// Unix timestamp (seconds) when the signal was written.
    pub created_at: u64,
}

impl ReleaseMessage {
    /// Build the channel key for a namespace.
    pub fn channel_key(app_id: &str, cluster_name: &str, namespace_name: &str) -> String {
        format!("{app_id}+{cluster_name}+{namespace_name}")
    }
}

// ── Gray-release rules ─────────────────────────────────────────────

/// Lifecycle status of a gray-release branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    /// Branch deleted without merging.
    Deleted,
    /// Branch live, serving a gray release to matched instances.
    Active,
    /// Branch merged back into the parent namespace.
    Merged,
}

/// One match clause of a gray-release rule: which client instances the
/// branch release applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrayRuleItem {
    /// Application id the clause matches.
    pub client_app_id: String,
    /// Instance IPs the clause matches.
    pub client_ip_list: Vec<String>,
}

/// A gray-release rule record: match clauses plus the release the branch
/// currently serves. Records are immutable once persisted; "updating" a
/// rule persists a new record and removes the previous one, and the active
/// rule for a tuple is the live record with the highest id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrayReleaseRule {
    /// Storage-assigned id. Latest wins.
    pub id: u64,
    pub app_id: AppId,
    pub cluster_name: String,
    pub namespace_name: String,
    /// Name of the branch (child) cluster this rule belongs to.
    pub branch_name: String,
    /// Ordered match clauses.
    pub rule_items: Vec<GrayRuleItem>,
    /// The release this branch currently serves (0 = none yet).
    pub release_id: u64,
    pub branch_status: BranchStatus,
    pub created_by: String,
    pub modified_by: String,
}

// ── Clusters & namespaces ──────────────────────────────────────────

/// A cluster of application instances. A gray-release branch is itself a
/// child cluster whose `parent_cluster_id` references the parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cluster {
    /// Storage-assigned entity id.
    pub id: u64,
    pub app_id: AppId,
    pub name: String,
    /// Id of the parent cluster, or 0 for a top-level cluster.
    pub parent_cluster_id: u64,
    pub created_by: String,
    pub modified_by: String,
}

impl Cluster {
    /// True if this cluster is a gray-release branch of another cluster.
    pub fn is_branch(&self) -> bool {
        self.parent_cluster_id != 0
    }

    /// Build the composite key for the clusters table.
    pub fn table_key(&self) -> String {
        cluster_key(&self.app_id, &self.name)
    }
}

/// Build the clusters table key for an (app, cluster) pair.
pub fn cluster_key(app_id: &str, name: &str) -> String {
    format!("{app_id}/{name}")
}

/// A named configuration unit scoped to an application and cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    /// Storage-assigned entity id.
    pub id: u64,
    pub app_id: AppId,
    pub cluster_name: String,
    pub namespace_name: String,
    pub created_by: String,
    pub modified_by: String,
}

impl Namespace {
    /// Build the composite key for the namespaces table.
    pub fn table_key(&self) -> String {
        namespace_key(&self.app_id, &self.cluster_name, &self.namespace_name)
    }
}

/// Build the namespaces table key for an (app, cluster, namespace) triple.
pub fn namespace_key(app_id: &str, cluster_name: &str, namespace_name: &str) -> String {
    format!("{app_id}/{cluster_name}/{namespace_name}")
}

// ── Releases ───────────────────────────────────────────────────────

/// A published configuration snapshot for a namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    /// Storage-assigned id.
    pub id: u64,
    pub app_id: AppId,
    pub cluster_name: String,
    pub namespace_name: String,
    /// The released key/value configuration.
    pub configurations: BTreeMap<String, String>,
    /// Abandoned releases are skipped when resolving the latest active one.
    pub abandoned: bool,
    pub operator: String,
    /// Unix timestamp (seconds) when the release was published.
    pub created_at: u64,
}

// ── Release history & audit ────────────────────────────────────────

/// Operation recorded in the release history trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOperation {
    /// Normal full release of a namespace.
    NormalRelease,
    /// Gray rules applied or replaced on a branch.
    ApplyGrayRules,
    /// Branch deleted after its release was merged into the parent.
    GrayReleaseDeletedAfterMerge,
    /// Branch abandoned without merging.
    AbandonGrayRelease,
}

/// One entry in the release history trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseHistory {
    /// Storage-assigned id.
    pub id: u64,
    pub app_id: AppId,
    pub cluster_name: String,
    pub namespace_name: String,
    pub branch_name: String,
    pub previous_release_id: u64,
    pub release_id: u64,
    pub operation: ReleaseOperation,
    /// Free-form context (e.g. old and new rule clauses).
    pub operation_context: serde_json::Value,
    pub operator: String,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

/// Kind of change recorded in an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    Insert,
    Update,
    Delete,
}

/// An audit record for an entity mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Audit {
    /// Storage-assigned id.
    pub id: u64,
    /// Entity type, e.g. "Cluster" or "Branch".
    pub entity_name: String,
    /// Id of the mutated entity.
    pub entity_id: u64,
    pub operation: AuditOp,
    pub operator: String,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

// ── Namespace locks ────────────────────────────────────────────────

/// An edit lock on a namespace. At most one lock per namespace; acquiring
/// an already-held lock fails unless the holder matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceLock {
    pub namespace_id: u64,
    pub locked_by: String,
}
