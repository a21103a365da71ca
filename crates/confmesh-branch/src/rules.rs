//! GrayReleaseRuleStore — latest-wins rule records per branch tuple.
//!
//! Rule records are immutable; replacing a rule persists the new record
//! and removes the old one inside a single storage transaction, so
//! readers see exactly one "current" record per
//! (app, cluster, namespace, branch) tuple at all times.

use confmesh_state::{BranchStatus, GrayReleaseRule, StateResult, StateStore};
use tracing::debug;

/// Store facade for gray-release rule records.
#[derive(Clone)]
pub struct GrayReleaseRuleStore {
    state: StateStore,
}

impl GrayReleaseRuleStore {
    /// Create a rule store over the given state store.
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// The current rule for a branch tuple, if any.
    pub fn active_rule(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
        branch_name: &str,
    ) -> StateResult<Option<GrayReleaseRule>> {
        self.state
            .latest_gray_rule(app_id, cluster_name, namespace_name, branch_name)
    }

    /// Persist `new_rule` and retire the previous record for the same
    /// tuple, atomically. The id on `new_rule` is assigned by storage.
    pub fn replace_rule(&self, new_rule: GrayReleaseRule) -> StateResult<GrayReleaseRule> {
        let old = self.state.latest_gray_rule(
            &new_rule.app_id,
            &new_rule.cluster_name,
            &new_rule.namespace_name,
            &new_rule.branch_name,
        )?;
        self.state
            .replace_gray_rule(new_rule, old.map(|rule| rule.id))
    }

    /// Rebind the branch's rule to a new release id, keeping the match
    /// clauses. Returns `None` if the tuple has no active rule.
    pub fn rebind_release_id(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
        branch_name: &str,
        new_release_id: u64,
        operator: &str,
    ) -> StateResult<Option<GrayReleaseRule>> {
        let Some(old) = self.active_rule(app_id, cluster_name, namespace_name, branch_name)? else {
            return Ok(None);
        };

        let new_rule = GrayReleaseRule {
            id: 0,
            app_id: old.app_id.clone(),
            cluster_name: old.cluster_name.clone(),
            namespace_name: old.namespace_name.clone(),
            branch_name: old.branch_name.clone(),
            rule_items: old.rule_items.clone(),
            release_id: new_release_id,
            branch_status: BranchStatus::Active,
            created_by: operator.to_string(),
            modified_by: operator.to_string(),
        };
        let saved = self.state.replace_gray_rule(new_rule, Some(old.id))?;
        debug!(
            branch = %saved.branch_name,
            release_id = new_release_id,
            "gray rule rebound to new release"
        );
        Ok(Some(saved))
    }
}
