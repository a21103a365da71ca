//! Error types for branch lifecycle operations.

use confmesh_state::StateError;
use thiserror::Error;

/// Result type alias for branch operations.
pub type BranchResult<T> = Result<T, BranchError>;

/// Errors from branch lifecycle operations.
///
/// The first two are precondition failures reported to the operator-facing
/// caller with no state mutated; `State` wraps storage failures, which
/// abort the enclosing operation.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("namespace {namespace_name} of {app_id}/{cluster_name} already has a branch")]
    BranchExists {
        app_id: String,
        cluster_name: String,
        namespace_name: String,
    },

    #[error("cluster {0} does not exist or is itself a branch")]
    InvalidParentCluster(String),

    #[error(transparent)]
    State(#[from] StateError),
}
