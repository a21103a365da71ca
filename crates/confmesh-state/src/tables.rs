//! redb table definitions for the confmesh state store.
//!
//! Id-assigned records (release messages, gray rules, releases, history,
//! audits) use `u64` keys so ascending id scans map directly onto key order.
//! Clusters and namespaces use composite `&str` keys for prefix scans.
//! Values are JSON-serialized domain types.

use redb::TableDefinition;

/// Release change signals keyed by storage-assigned id.
pub const RELEASE_MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("release_messages");

/// Gray-release rule records keyed by storage-assigned id.
pub const GRAY_RULES: TableDefinition<u64, &[u8]> = TableDefinition::new("gray_rules");

/// Releases keyed by storage-assigned id.
pub const RELEASES: TableDefinition<u64, &[u8]> = TableDefinition::new("releases");

/// Release history entries keyed by storage-assigned id.
pub const RELEASE_HISTORY: TableDefinition<u64, &[u8]> = TableDefinition::new("release_history");

/// Audit records keyed by storage-assigned id.
pub const AUDITS: TableDefinition<u64, &[u8]> = TableDefinition::new("audits");

/// Clusters keyed by `{app_id}/{name}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Namespaces keyed by `{app_id}/{cluster_name}/{namespace_name}`.
pub const NAMESPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("namespaces");

/// Namespace edit locks keyed by namespace id.
pub const NAMESPACE_LOCKS: TableDefinition<u64, &[u8]> = TableDefinition::new("namespace_locks");

/// Store-internal counters (entity id sequence).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Meta key for the cluster/namespace entity id sequence.
pub const ENTITY_ID_SEQ: &str = "entity_id_seq";
