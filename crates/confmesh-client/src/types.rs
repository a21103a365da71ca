//! Snapshot and change-event types for the client pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A raw property snapshot: ordered key/value configuration. Replaced
/// wholesale on every successful sync and compared by value, never
/// mutated in place.
pub type Properties = BTreeMap<String, String>;

/// Where the current snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSourceType {
    /// No successful sync yet.
    None,
    /// Local file on disk.
    Local,
    /// Remote config service.
    Remote,
}

/// Classification of a config-file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Content appeared where there was none.
    Added,
    /// Content changed.
    Modified,
    /// Content disappeared.
    Deleted,
}

/// One typed change event for a namespace's config-file content.
/// Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFileChangeEvent {
    pub namespace: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_type: ChangeType,
}
