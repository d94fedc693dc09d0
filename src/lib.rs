//! Folio - portable archives for electronic lab notebooks
//!
//! Folio exports a permission-filtered, link-connected part of a notebook
//! instance into a single `.folio.tar.zst` archive, and imports such
//! archives into the same or another instance with fresh identities.
//!
//! # Quick Start
//!
//! ```ignore
//! use folio::{ArchiveEngine, EngineConfig, ExportConfig, ExportScope, ImportConfig};
//!
//! let engine = ArchiveEngine::builder(store, oracle)
//!     .config(EngineConfig::with_archive_dir("/var/folio/archives"))
//!     .build()?;
//!
//! let bundle = engine.export(&identity, &ExportScope::Folder(project), &ExportConfig::structured())?;
//! let report = engine.import(&identity, &bundle.path, &ImportConfig::ignore_users())?;
//! assert!(report.success());
//! ```
//!
//! # Architecture
//!
//! - `folio-core`: data model, link markup, errors, collaborator traits
//! - `folio-bundle`: archive format, writer/reader, quota guard, retention sweep
//! - `folio-engine`: scope resolution, graph walk, version selection,
//!   packaging, import and job orchestration

pub use folio_bundle::{
    ArchiveBundle, ArchiveLeases, ArchiveManifest, ArchiveReader, BundleVerifyInfo, ResourceGuard,
    SweepReport,
};
pub use folio_core::*;
pub use folio_engine::{
    ArchiveEngine, ArchiveEngineBuilder, CancellationToken, EngineConfig, ExportScope,
    ImportItemError, ImportPhase, ImportReport, ImportedRecord, Job, JobId,
};
