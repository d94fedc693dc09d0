//! Core types and traits for the Folio archive engine
//!
//! This crate defines the foundational types used throughout the system:
//! - Identities: NodeId, UserId, GroupId, Identity
//! - ContentNode: closed enum of exportable kinds with per-kind payloads
//! - Revision, Link, Signature, MediaVersion
//! - Markup: link tokens embedded in field content
//! - ExportConfig / ImportConfig: request parameters
//! - ArchiveError: error taxonomy
//! - Traits: collaborator contracts (ContentStore, PermissionOracle, ...)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod markup;
pub mod node;
pub mod traits;
pub mod types;

pub use config::{ArchiveFormat, ExportConfig, ImportConfig, ImportScope};
pub use error::{ArchiveError, Result, StoreError};
pub use node::{
    AnnotationKind, ContentNode, Field, GlobalId, Link, LinkKind, LinkPolicy, MediaVersion,
    NodeBody, NodeKind, Revision, Signature,
};
pub use traits::{
    ContentStore, FilestoreClient, FilestoreEntry, JobKind, JobOutcome, JobStatus, NewUser,
    NodeCommit, NotificationSink, PermissionOracle, StoreResult,
};
pub use types::{
    Group, GroupId, Identity, MediaVersionNumber, NodeId, RevisionNumber, Timestamp, User, UserId,
};
