//! BranchManager — drives the gray-release branch state machine.
//!
//! Per namespace the lifecycle is: no branch → branched (rules active) →
//! merged or abandoned, which is terminal: the branch cluster is deleted
//! and the namespace can be branched again from scratch.
//!
//! History and audit recording are fire-and-forget: recorder failures are
//! logged and never fail the lifecycle operation that triggered them.

use confmesh_state::{
    AuditOp, BranchStatus, Cluster, GrayReleaseRule, GrayRuleItem, Namespace, ReleaseHistory,
    ReleaseOperation, StateStore,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{BranchError, BranchResult};
use crate::rules::GrayReleaseRuleStore;

/// Manages branch creation, gray-rule updates, and branch deletion for
/// namespaces.
#[derive(Clone)]
pub struct BranchManager {
    state: StateStore,
    rules: GrayReleaseRuleStore,
}

impl BranchManager {
    /// Create a branch manager over the given state store.
    pub fn new(state: StateStore) -> Self {
        let rules = GrayReleaseRuleStore::new(state.clone());
        Self { state, rules }
    }

    /// The rule store this manager operates on.
    pub fn rules(&self) -> &GrayReleaseRuleStore {
        &self.rules
    }

    /// Create a gray-release branch for a namespace.
    ///
    /// Fails if the namespace already has a live branch, or if the parent
    /// cluster is missing or is itself a branch. The branch cluster and
    /// its namespace are persisted atomically.
    pub fn create_branch(
        &self,
        app_id: &str,
        parent_cluster_name: &str,
        namespace_name: &str,
        operator: &str,
    ) -> BranchResult<Namespace> {
        if self
            .find_branch(app_id, parent_cluster_name, namespace_name)?
            .is_some()
        {
            return Err(BranchError::BranchExists {
                app_id: app_id.to_string(),
                cluster_name: parent_cluster_name.to_string(),
                namespace_name: namespace_name.to_string(),
            });
        }

        let parent = self
            .state
            .find_cluster(app_id, parent_cluster_name)?
            .filter(|cluster| !cluster.is_branch())
            .ok_or_else(|| BranchError::InvalidParentCluster(parent_cluster_name.to_string()))?;

        let branch_name = branch_cluster_name(app_id, parent_cluster_name, namespace_name);
        let child_cluster = Cluster {
            id: 0,
            app_id: app_id.to_string(),
            name: branch_name.clone(),
            parent_cluster_id: parent.id,
            created_by: operator.to_string(),
            modified_by: operator.to_string(),
        };
        let child_namespace = Namespace {
            id: 0,
            app_id: app_id.to_string(),
            cluster_name: branch_name.clone(),
            namespace_name: namespace_name.to_string(),
            created_by: operator.to_string(),
            modified_by: operator.to_string(),
        };
        let (cluster, namespace) = self
            .state
            .create_branch_records(child_cluster, child_namespace)?;

        if let Err(e) = self
            .state
            .append_audit("Branch", cluster.id, AuditOp::Insert, operator)
        {
            warn!(error = %e, branch = %branch_name, "failed to record branch creation audit");
        }

        info!(
            %app_id,
            parent = %parent_cluster_name,
            namespace = %namespace_name,
            branch = %branch_name,
            "branch created"
        );
        Ok(namespace)
    }

    /// Find the branch namespace of a parent namespace, if one exists.
    pub fn find_branch(
        &self,
        app_id: &str,
        parent_cluster_name: &str,
        namespace_name: &str,
    ) -> BranchResult<Option<Namespace>> {
        let Some(parent) = self.state.find_cluster(app_id, parent_cluster_name)? else {
            return Ok(None);
        };
        let Some(child) = self.state.child_cluster_of(parent.id)? else {
            return Ok(None);
        };
        Ok(self
            .state
            .find_namespace(app_id, &child.name, namespace_name)?)
    }

    /// Replace the branch's gray rules.
    ///
    /// The new rule is stamped with the branch's latest active release id
    /// (0 if the branch has not released yet), and a release-history entry
    /// capturing old and new clauses is recorded.
    pub fn update_gray_rules(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
        branch_name: &str,
        rule_items: Vec<GrayRuleItem>,
        operator: &str,
    ) -> BranchResult<GrayReleaseRule> {
        self.apply_gray_rules(
            app_id,
            cluster_name,
            namespace_name,
            branch_name,
            rule_items,
            BranchStatus::Active,
            operator,
            Some(ReleaseOperation::ApplyGrayRules),
        )
    }

    /// Delete a branch after merge or on abandonment.
    ///
    /// No-op if the branch cluster does not exist. The rules are nullified
    /// (replaced with an empty clause set) before the cluster is deleted,
    /// so no in-flight gray lookup can resolve to a deleted cluster.
    pub fn delete_branch(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
        branch_name: &str,
        branch_status: BranchStatus,
        operator: &str,
    ) -> BranchResult<()> {
        let Some(branch_cluster) = self.state.find_cluster(app_id, branch_name)? else {
            debug!(%app_id, branch = %branch_name, "branch cluster absent, nothing to delete");
            return Ok(());
        };

        let nullified = self.apply_gray_rules(
            app_id,
            cluster_name,
            namespace_name,
            branch_name,
            Vec::new(),
            branch_status,
            operator,
            None,
        )?;

        self.state.delete_cluster_cascade(app_id, branch_name)?;

        let operation = if branch_status == BranchStatus::Merged {
            ReleaseOperation::GrayReleaseDeletedAfterMerge
        } else {
            ReleaseOperation::AbandonGrayRelease
        };
        self.record_history(
            app_id,
            cluster_name,
            namespace_name,
            branch_name,
            nullified.release_id,
            operation,
            serde_json::Value::Null,
            operator,
        );

        if let Err(e) =
            self.state
                .append_audit("Branch", branch_cluster.id, AuditOp::Delete, operator)
        {
            warn!(error = %e, branch = %branch_name, "failed to record branch deletion audit");
        }

        info!(
            %app_id,
            namespace = %namespace_name,
            branch = %branch_name,
            status = ?branch_status,
            "branch deleted"
        );
        Ok(())
    }

    /// Build and persist a replacement rule for the branch, stamping it
    /// with the branch's latest active release id.
    #[allow(clippy::too_many_arguments)]
    fn apply_gray_rules(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
        branch_name: &str,
        rule_items: Vec<GrayRuleItem>,
        branch_status: BranchStatus,
        operator: &str,
        record: Option<ReleaseOperation>,
    ) -> BranchResult<GrayReleaseRule> {
        let old_rule = self
            .rules
            .active_rule(app_id, cluster_name, namespace_name, branch_name)?;

        // Branch releases live under the branch cluster, so the cluster
        // for the release lookup is the branch name.
        let latest_release_id = self
            .state
            .find_latest_active_release(app_id, branch_name, namespace_name)?
            .map(|release| release.id)
            .unwrap_or(0);

        let new_rule = GrayReleaseRule {
            id: 0,
            app_id: app_id.to_string(),
            cluster_name: cluster_name.to_string(),
            namespace_name: namespace_name.to_string(),
            branch_name: branch_name.to_string(),
            rule_items,
            release_id: latest_release_id,
            branch_status,
            created_by: operator.to_string(),
            modified_by: operator.to_string(),
        };
        let saved = self
            .state
            .replace_gray_rule(new_rule, old_rule.as_ref().map(|rule| rule.id))?;

        if let Some(operation) = record {
            let mut context = serde_json::Map::new();
            context.insert(
                "rules".to_string(),
                serde_json::to_value(&saved.rule_items).unwrap_or_default(),
            );
            if let Some(old) = &old_rule {
                context.insert(
                    "old_rules".to_string(),
                    serde_json::to_value(&old.rule_items).unwrap_or_default(),
                );
            }
            self.record_history(
                app_id,
                cluster_name,
                namespace_name,
                branch_name,
                latest_release_id,
                operation,
                serde_json::Value::Object(context),
                operator,
            );
        }

        Ok(saved)
    }

    /// Append a release-history entry, logging instead of failing.
    #[allow(clippy::too_many_arguments)]
    fn record_history(
        &self,
        app_id: &str,
        cluster_name: &str,
        namespace_name: &str,
        branch_name: &str,
        release_id: u64,
        operation: ReleaseOperation,
        operation_context: serde_json::Value,
        operator: &str,
    ) {
        let entry = ReleaseHistory {
            id: 0,
            app_id: app_id.to_string(),
            cluster_name: cluster_name.to_string(),
            namespace_name: namespace_name.to_string(),
            branch_name: branch_name.to_string(),
            previous_release_id: release_id,
            release_id,
            operation,
            operation_context,
            operator: operator.to_string(),
            created_at: 0,
        };
        if let Err(e) = self.state.append_release_history(entry) {
            warn!(error = %e, branch = %branch_name, ?operation, "failed to record release history");
        }
    }
}

/// Deterministic branch-cluster name for an (app, parent cluster,
/// namespace) triple: same inputs always yield the same name, so repeated
/// lookups are idempotent and a second create collides instead of
/// multiplying.
fn branch_cluster_name(app_id: &str, parent_cluster_name: &str, namespace_name: &str) -> String {
    let mut hasher = Sha256::new();
    // NUL separators keep adjacent fields from aliasing each other.
    hasher.update(app_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(parent_cluster_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(namespace_name.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{parent_cluster_name}-gray-{}", &digest[..12])
}
