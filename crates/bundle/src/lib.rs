//! Portable archive format for the Folio engine
//!
//! This crate implements the bundle that export jobs write and import jobs
//! read: a single `.folio.tar.zst` archive.
//!
//! ## Archive Structure
//!
//! ```text
//! export.folio.tar.zst
//! └── archive/
//!     ├── units/000001-folder.json      — structured node units
//!     ├── units/000003-revision.json    — structured revision units
//!     ├── html/000001-folder.html       — rendered pages (rendered archives)
//!     ├── index.html                    — rendered entry page
//!     ├── external-links.html           — rendered filestore link summary
//!     ├── resources/000004/v1-gel.png   — embedded binaries, per owning unit
//!     └── MANIFEST.json                 — entity list, checksums (written last)
//! ```
//!
//! ## Design Principles
//!
//! - **Self-describing**: every internal reference is bundle-local
//! - **Atomic**: written to a temp file and renamed; failures leave nothing
//! - **Bounded**: a per-job [`ResourceGuard`] caps the bytes written
//! - **Inspectable**: standard tools (tar, zstd, jq) can read the contents

pub mod error;
pub mod guard;
pub mod reader;
pub mod retention;
pub mod types;
pub mod writer;

pub use error::{BundleError, BundleResult};
pub use guard::{QuotaExceeded, ResourceGuard, DEFAULT_CEILING_BYTES};
pub use reader::{ArchiveContents, ArchiveReader};
pub use retention::{
    file_checksum, mark_removable, ArchiveLeases, LeaseGuard, RetentionSweeper, SweepReport,
};
pub use types::{
    paths, xxh3_hex, ArchiveBundle, ArchiveManifest, BundleVerifyInfo, GroupRecord,
    ManifestEntry, NfsFileRecord, NodeUnit, RevisionUnit, SkipRecord, UnitBody, UnitLink,
    UnitMediaVersion, UnitSignature, UnitType, UserRecord, ARCHIVE_EXTENSION,
    ARCHIVE_FORMAT_VERSION,
};
pub use writer::{temp_path_for, ArchiveWriter};
