//! Export/import engine for Folio archives
//!
//! This crate turns a permission-filtered, link-connected part of a content
//! store into a portable archive and rebuilds archived content in a target
//! store:
//! - Scope resolution: what the requester asked for, and may read
//! - Graph walk: breadth-first closure over hyperlinks, attachments and templates
//! - Version selection: effective revisions and the binaries each revision referenced
//! - Packaging: structured or rendered archives, filestore embedding, quota enforcement
//! - Import: identity remapping, link rewriting, per-node atomic commits
//! - Jobs: cancellable background export and import, requester notifications
//!
//! The engine only talks to its surroundings through the collaborator traits
//! of `folio-core`. [`memory`] holds in-memory implementations of them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod importer;
pub mod job;
pub mod memory;
pub mod packager;
pub mod render;
pub mod scope;
pub mod snapshot;
pub mod versions;
pub mod walker;

pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use engine::{ArchiveEngine, ArchiveEngineBuilder};
pub use importer::{IdMap, ImportItemError, ImportPhase, ImportReport, ImportedRecord, Importer};
pub use job::{CancellationToken, Job, JobId};
pub use packager::{PackageContext, Packager};
pub use scope::{ExportScope, Inclusion, ScopeResolver, ScopeRoot, ScopeRoots};
pub use snapshot::SnapshotReader;
pub use versions::{SelectedRevision, VersionPlan, VersionSelector};
pub use walker::{ClosedSet, GraphWalker, NfsReference, Reached, WalkOptions, WalkedNode};
