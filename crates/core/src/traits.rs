//! Collaborator contracts consumed by the engine
//!
//! The engine never reimplements storage, permissions, remote filestores or
//! notification delivery. It talks to them through these traits, which
//! lets hosts plug in their own backends and tests use in-memory ones.
//!
//! Thread safety: all collaborators are shared between concurrent jobs and
//! must be `Send + Sync`.

use crate::error::{Result, StoreError};
use crate::node::{ContentNode, Revision};
use crate::types::{Group, GroupId, Identity, MediaVersionNumber, NodeId, User, UserId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result type for store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Decides whether an identity may read a node
pub trait PermissionOracle: Send + Sync {
    /// Whether `identity` may read `node`
    fn can_read(&self, identity: &Identity, node: &ContentNode) -> bool;
}

impl<F> PermissionOracle for F
where
    F: Fn(&Identity, &ContentNode) -> bool + Send + Sync,
{
    fn can_read(&self, identity: &Identity, node: &ContentNode) -> bool {
        self(identity, node)
    }
}

/// A node with its complete history, written atomically during import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCommit {
    /// Node with its reserved id and rewritten references
    pub node: ContentNode,
    /// Document revisions, ascending; the last one holds the current fields
    pub revisions: Vec<Revision>,
    /// Media binaries, ascending by version
    pub binaries: Vec<(MediaVersionNumber, Vec<u8>)>,
}

/// User account to create during import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    /// Login name
    pub username: String,
    /// Display name
    pub display_name: String,
    /// Contact address
    pub email: Option<String>,
}

/// Hierarchical content store
///
/// Read-only from the engine's perspective except for the import path,
/// which reserves ids and commits fresh nodes.
pub trait ContentStore: Send + Sync {
    /// Fetch a node
    fn get(&self, id: NodeId) -> StoreResult<Option<ContentNode>>;

    /// Children of a container or document, ordered by position
    fn children_of(&self, parent: NodeId) -> StoreResult<Vec<NodeId>>;

    /// Revisions of a document, ascending by number
    fn revisions_of(&self, document: NodeId) -> StoreResult<Vec<Revision>>;

    /// Binary content of one media version
    fn media_binary(
        &self,
        media: NodeId,
        version: MediaVersionNumber,
    ) -> StoreResult<Option<Vec<u8>>>;

    /// Look up a user by id
    fn user(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Look up a user by login name
    fn user_by_name(&self, username: &str) -> StoreResult<Option<User>>;

    /// Look up a group by id
    fn group(&self, id: GroupId) -> StoreResult<Option<Group>>;

    /// Look up a group by name
    fn group_by_name(&self, name: &str) -> StoreResult<Option<Group>>;

    /// Top-level folder of a user's content
    fn home_folder(&self, user: UserId) -> StoreResult<Option<NodeId>>;

    /// Allocate a fresh, never used node id
    fn reserve_id(&self) -> StoreResult<NodeId>;

    /// Atomically create a node with its revisions and binaries
    ///
    /// The node id must come from [`ContentStore::reserve_id`] and its parent,
    /// if any, must already exist.
    fn commit_node(&self, commit: NodeCommit) -> StoreResult<()>;

    /// Create a user account
    fn create_user(&self, user: NewUser) -> StoreResult<User>;

    /// Create a group
    fn create_group(&self, name: &str, members: &[UserId], pis: &[UserId]) -> StoreResult<Group>;
}

/// Entry of an external filestore listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilestoreEntry {
    /// Full path inside the filestore
    pub path: String,
    /// Folder or file
    pub is_folder: bool,
    /// File size in bytes (0 for folders)
    pub size: u64,
}

/// Client for external (network) filestores
///
/// Failures are per file. They surface as
/// [`crate::ArchiveError::ExternalFileUnavailable`] and never abort a job.
pub trait FilestoreClient: Send + Sync {
    /// Describe a path without fetching it
    fn stat(&self, filestore: &str, path: &str) -> Result<FilestoreEntry>;

    /// Fetch file content
    fn fetch_file(&self, filestore: &str, path: &str) -> Result<Vec<u8>>;

    /// List a folder's direct entries
    fn list_folder(&self, filestore: &str, path: &str) -> Result<Vec<FilestoreEntry>>;
}

/// Kind of background job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Archive export
    Export,
    /// Archive import
    Import,
}

/// Terminal status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Completed without errors
    Succeeded,
    /// Completed with per-item errors (import only)
    PartiallySucceeded,
    /// Aborted by a fatal error
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

/// Outcome delivered to the requester after a job ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job identifier
    pub job_id: String,
    /// Export or import
    pub kind: JobKind,
    /// Terminal status
    pub status: JobStatus,
    /// Human-readable summary
    pub message: String,
    /// Written archive, for successful exports
    pub archive: Option<PathBuf>,
}

/// Fire-and-forget delivery of job outcomes
pub trait NotificationSink: Send + Sync {
    /// Deliver an outcome; must not block or fail the job
    fn notify(&self, user: UserId, outcome: &JobOutcome);
}
