//! Error types for the confmesh client.

use thiserror::Error;

/// Result type alias for client-side operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors from the client-side config pipeline.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to fetch from config source: {0}")]
    Source(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
