//! Error types for the archive engine
//!
//! Failures split into two classes. Fatal errors compromise the whole
//! artifact and abort the job (`AuthorizationDenied`, `QuotaExceeded`,
//! `MalformedBundle`, `Cancelled`). Entity-scoped errors
//! (`ExternalFileUnavailable`, `EntityMaterializationFailed`) are
//! accumulated into the manifest or import report and the job continues.

use crate::node::NodeKind;
use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Result type alias for archive operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors raised by a content store collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Write rejected by a store constraint
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Error taxonomy of export and import jobs
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Requester may not read an explicitly requested node or scope
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The running byte total of an export exceeded its ceiling
    #[error(
        "Quota exceeded: writing {attempted} more bytes would exceed \
         the ceiling of {ceiling} bytes ({used} already used)"
    )]
    QuotaExceeded {
        /// Configured ceiling in bytes
        ceiling: u64,
        /// Bytes accounted before the rejected write
        used: u64,
        /// Size of the rejected write
        attempted: u64,
    },

    /// An external filestore file could not be fetched
    #[error("External file unavailable: {path}: {reason}")]
    ExternalFileUnavailable {
        /// Filestore path
        path: String,
        /// Collaborator message
        reason: String,
    },

    /// Bundle is structurally invalid or not importable
    #[error("Malformed bundle: {0}")]
    MalformedBundle(String),

    /// One node could not be created during import
    #[error("Failed to materialize {kind} {entity}: {reason}")]
    EntityMaterializationFailed {
        /// Bundle-local or source id of the entity
        entity: String,
        /// Kind of the entity
        kind: NodeKind,
        /// Why it failed
        reason: String,
    },

    /// A requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request parameters are invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The job was cancelled between entities
    #[error("Job cancelled")]
    Cancelled,

    /// Content store failure outside per-node materialization
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal invariant broken
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Create an authorization error naming the denied node
    pub fn denied(node: NodeId) -> Self {
        Self::AuthorizationDenied(format!("cannot read node {}", node))
    }

    /// Create a not-found error for a node
    pub fn node_not_found(node: NodeId) -> Self {
        Self::NotFound(format!("node {}", node))
    }

    /// Create a malformed bundle error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedBundle(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error aborts the whole job
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ArchiveError::ExternalFileUnavailable { .. }
                | ArchiveError::EntityMaterializationFailed { .. }
        )
    }
}
