//! Archive bundle core types
//!
//! Types for the archive format (`.folio.tar.zst`): manifest, structured
//! units and the records the manifest keeps about users, groups, external
//! files and skipped items.

use folio_core::{
    AnnotationKind, ArchiveFormat, Field, MediaVersionNumber, NodeId, NodeKind, RevisionNumber,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Current archive format version
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// File extension for archive bundles
pub const ARCHIVE_EXTENSION: &str = ".folio.tar.zst";

/// Archive paths within the bundle
///
/// Every path is relative to [`paths::ROOT`]; the writer adds the prefix.
pub mod paths {
    /// Root directory in the archive
    pub const ROOT: &str = "archive";
    /// Bundle manifest file
    pub const MANIFEST: &str = "MANIFEST.json";
    /// Structured unit directory
    pub const UNITS_DIR: &str = "units";
    /// Rendered page directory
    pub const PAGES_DIR: &str = "html";
    /// Embedded binaries directory
    pub const RESOURCES_DIR: &str = "resources";
    /// Rendered archive entry page
    pub const INDEX: &str = "index.html";
    /// Rendered summary of external filestore links
    pub const EXTERNAL_LINKS: &str = "external-links.html";

    /// Structured unit file, e.g. `units/000003-document.json`
    pub fn unit(seq: u64, unit_type: &str) -> String {
        format!("{}/{:06}-{}.json", UNITS_DIR, seq, unit_type)
    }

    /// Rendered page file name, relative to the pages directory
    pub fn page_name(seq: u64, unit_type: &str) -> String {
        format!("{:06}-{}.html", seq, unit_type)
    }

    /// Rendered page file, e.g. `html/000003-document.html`
    pub fn page(seq: u64, unit_type: &str) -> String {
        format!("{}/{}", PAGES_DIR, page_name(seq, unit_type))
    }

    /// Embedded media binary owned by unit `owner_seq`
    pub fn media_binary(owner_seq: u64, version: u32, file_name: &str) -> String {
        format!(
            "{}/{:06}/v{}-{}",
            RESOURCES_DIR,
            owner_seq,
            version,
            sanitize_segment(file_name)
        )
    }

    /// Embedded external filestore file owned by unit `owner_seq`
    pub fn nfs_file(owner_seq: u64, filestore: &str, path: &str) -> String {
        let rel: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            .map(sanitize_segment)
            .collect();
        format!(
            "{}/{:06}/nfs/{}/{}",
            RESOURCES_DIR,
            owner_seq,
            sanitize_segment(filestore),
            rel.join("/")
        )
    }

    /// Replace characters that are unsafe in a single path segment
    pub fn sanitize_segment(name: &str) -> String {
        let cleaned: String = name
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '\0' => '_',
                c => c,
            })
            .collect();
        match cleaned.as_str() {
            "" | "." | ".." => "_".to_string(),
            _ => cleaned,
        }
    }
}

// =============================================================================
// MANIFEST.json
// =============================================================================

/// Type of a serialized unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    /// Document node
    Document,
    /// Folder node
    Folder,
    /// Notebook node
    Notebook,
    /// Media file node
    Media,
    /// Comment node
    Comment,
    /// Annotation node
    Annotation,
    /// Document revision
    Revision,
}

impl UnitType {
    /// Name used in unit file names
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Document => "document",
            UnitType::Folder => "folder",
            UnitType::Notebook => "notebook",
            UnitType::Media => "media",
            UnitType::Comment => "comment",
            UnitType::Annotation => "annotation",
            UnitType::Revision => "revision",
        }
    }
}

impl From<NodeKind> for UnitType {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Document => UnitType::Document,
            NodeKind::Folder => UnitType::Folder,
            NodeKind::Notebook => UnitType::Notebook,
            NodeKind::MediaFile => UnitType::Media,
            NodeKind::Comment => UnitType::Comment,
            NodeKind::Annotation(_) => UnitType::Annotation,
        }
    }
}

/// One serialized unit listed in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Bundle-local sequence number
    pub seq: u64,
    /// Unit type
    pub unit_type: UnitType,
    /// Path relative to the archive root
    pub path: String,
    /// Global id of the source entity (documents for revisions)
    pub source_global_id: String,
}

/// A user referenced by content in the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Login name
    pub username: String,
    /// Display name
    pub display_name: String,
    /// Contact address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A group exported with its content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Group name
    pub name: String,
    /// Member usernames
    pub members: Vec<String>,
    /// PI usernames
    pub pis: Vec<String>,
}

/// Item left out of the bundle, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    /// Unit whose content referenced the item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_seq: Option<u64>,
    /// What was skipped (path or global id)
    pub item: String,
    /// Structured reason, e.g. `file skipped (file extension 'x' excluded)`
    pub reason: String,
}

/// External filestore file embedded in the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsFileRecord {
    /// Unit whose content referenced the file
    pub owner_seq: u64,
    /// Filestore name
    pub filestore: String,
    /// Path inside the filestore
    pub path: String,
    /// Path inside the archive
    pub bundle_path: String,
    /// Size in bytes
    pub size: u64,
}

/// Bundle manifest - format metadata, entity list and checksums
///
/// Written as the last entry of the archive, once every unit and binary
/// has been accounted for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveManifest {
    /// Format version
    pub format_version: u32,

    /// Structured or rendered
    pub archive_type: ArchiveFormat,

    /// Engine version that created this bundle
    pub tool_version: String,

    /// RFC 3339 timestamp of generation
    pub generated_at: String,

    /// Free-text description
    pub description: String,

    /// Base URL of the exporting instance
    pub source_instance: String,

    /// Number of serialized units
    pub entity_count: u64,

    /// Every serialized unit, ascending by sequence number
    pub entities: Vec<ManifestEntry>,

    /// Users referenced by the content
    #[serde(default)]
    pub users: Vec<UserRecord>,

    /// Groups exported with the content
    #[serde(default)]
    pub groups: Vec<GroupRecord>,

    /// Embedded external filestore files
    #[serde(default)]
    pub nfs_files: Vec<NfsFileRecord>,

    /// Items left out, each with a reason
    #[serde(default)]
    pub skipped: Vec<SkipRecord>,

    /// Checksum algorithm used (currently "xxh3")
    pub checksum_algorithm: String,

    /// Checksums of every other file, keyed by archive-relative path
    pub checksums: BTreeMap<String, String>,
}

impl ArchiveManifest {
    /// Create an empty manifest stamped with the current time
    pub fn new(
        archive_type: ArchiveFormat,
        source_instance: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            format_version: ARCHIVE_FORMAT_VERSION,
            archive_type,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            description: description.into(),
            source_instance: source_instance.into(),
            entity_count: 0,
            entities: Vec::new(),
            users: Vec::new(),
            groups: Vec::new(),
            nfs_files: Vec::new(),
            skipped: Vec::new(),
            checksum_algorithm: "xxh3".to_string(),
            checksums: BTreeMap::new(),
        }
    }

    /// Add a checksum for a file
    pub fn add_checksum(&mut self, path: impl Into<String>, checksum: impl Into<String>) {
        self.checksums.insert(path.into(), checksum.into());
    }

    /// Look up a listed unit
    pub fn entry(&self, seq: u64) -> Option<&ManifestEntry> {
        self.entities.iter().find(|e| e.seq == seq)
    }
}

// =============================================================================
// Structured units
// =============================================================================

/// Link stored in a unit outside field content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum UnitLink {
    /// Bundle-local unit
    Ref(u64),
    /// Absolute URL outside the bundle
    Url(String),
}

/// Signing record of a document unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSignature {
    /// Sequence number of the revision unit that was signed
    pub revision_seq: u64,
    /// Signer username
    pub signer: String,
    /// Signing time
    pub signed_at: Timestamp,
}

/// One media binary stored in the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMediaVersion {
    /// Version number in the source instance
    pub version: MediaVersionNumber,
    /// When the binary was stored
    pub created_at: Timestamp,
    /// Size in bytes
    pub size: u64,
    /// Archive-relative path of the binary
    pub path: String,
}

/// Kind-specific payload of a node unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitBody {
    /// Document; field values live in its revision units
    Document {
        /// Template provenance
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template: Option<UnitLink>,
        /// Signing record
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<UnitSignature>,
        /// Revision units, ascending by revision number
        revisions: Vec<u64>,
    },
    /// Folder
    Folder,
    /// Notebook
    Notebook,
    /// Media file
    Media {
        /// File name
        file_name: String,
        /// MIME type
        content_type: String,
        /// Embedded binaries, ascending by version
        versions: Vec<UnitMediaVersion>,
    },
    /// Comment
    Comment {
        /// Author username
        author: String,
        /// Comment text
        text: String,
    },
    /// Annotated element
    Annotation {
        /// Element kind
        kind: AnnotationKind,
        /// Element data
        data: String,
    },
}

/// Structured unit of one content node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUnit {
    /// Bundle-local sequence number
    pub seq: u64,
    /// Id in the source instance (provenance only, never used to resolve)
    pub source_id: NodeId,
    /// Global id in the source instance
    pub global_id: String,
    /// Display name
    pub name: String,
    /// Owner username
    pub owner: String,
    /// Parent unit, when the parent is part of the bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_seq: Option<u64>,
    /// Ordering among siblings
    pub position: u32,
    /// Creation time
    pub created_at: Timestamp,
    /// Last modification time
    pub modified_at: Timestamp,
    /// Kind-specific payload
    pub body: UnitBody,
}

impl NodeUnit {
    /// Node kind of this unit
    pub fn kind(&self) -> NodeKind {
        match &self.body {
            UnitBody::Document { .. } => NodeKind::Document,
            UnitBody::Folder => NodeKind::Folder,
            UnitBody::Notebook => NodeKind::Notebook,
            UnitBody::Media { .. } => NodeKind::MediaFile,
            UnitBody::Comment { .. } => NodeKind::Comment,
            UnitBody::Annotation { kind, .. } => NodeKind::Annotation(*kind),
        }
    }
}

/// Structured unit of one document revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionUnit {
    /// Bundle-local sequence number
    pub seq: u64,
    /// Owning document unit
    pub document_seq: u64,
    /// Revision number in the source instance
    pub number: RevisionNumber,
    /// Modifier username
    pub modifier: String,
    /// When the revision became current
    pub modified_at: Timestamp,
    /// Whether this is the document's effective revision
    pub effective: bool,
    /// Field values with bundle-local link tokens
    pub fields: Vec<Field>,
}

// =============================================================================
// Result types
// =============================================================================

/// A written archive
#[derive(Debug, Clone)]
pub struct ArchiveBundle {
    /// Where the bundle was written
    pub path: PathBuf,
    /// xxh3 checksum of the whole bundle file
    pub checksum: String,
    /// Size of the bundle file in bytes
    pub size_bytes: u64,
    /// Manifest as written into the bundle
    pub manifest: ArchiveManifest,
}

/// Information returned after verifying a bundle
#[derive(Debug, Clone)]
pub struct BundleVerifyInfo {
    /// Format version of the bundle
    pub format_version: u32,
    /// Structured or rendered
    pub archive_type: ArchiveFormat,
    /// Declared number of units
    pub entity_count: u64,
    /// Manifest description
    pub description: String,
    /// Whether all checksums are valid
    pub checksums_valid: bool,
}

/// Compute xxh3 hash of data and return as hex string
pub fn xxh3_hex(data: &[u8]) -> String {
    use xxhash_rust::xxh3::xxh3_64;
    format!("{:016x}", xxh3_64(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_new() {
        let manifest = ArchiveManifest::new(
            ArchiveFormat::Structured,
            "https://eln.example.org",
            "weekly backup",
        );
        assert_eq!(manifest.format_version, ARCHIVE_FORMAT_VERSION);
        assert_eq!(manifest.checksum_algorithm, "xxh3");
        assert_eq!(manifest.description, "weekly backup");
        assert!(manifest.checksums.is_empty());
        assert!(chrono::DateTime::parse_from_rfc3339(&manifest.generated_at).is_ok());
    }

    #[test]
    fn test_manifest_json_roundtrip() {
        let mut manifest = ArchiveManifest::new(ArchiveFormat::Rendered, "https://a", "d");
        manifest.add_checksum("units/000001-document.json", "checksum123");
        manifest.entities.push(ManifestEntry {
            seq: 1,
            unit_type: UnitType::Document,
            path: paths::unit(1, "document"),
            source_global_id: "SD1".into(),
        });
        manifest.entity_count = 1;

        let json = serde_json::to_string_pretty(&manifest).unwrap();
        let parsed: ArchiveManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(manifest, parsed);
        assert!(json.contains("\"archive_type\": \"rendered\""));
        assert_eq!(parsed.entry(1).unwrap().source_global_id, "SD1");
    }

    #[test]
    fn test_paths() {
        assert_eq!(paths::unit(3, "document"), "units/000003-document.json");
        assert_eq!(paths::page(12, "folder"), "html/000012-folder.html");
        assert_eq!(
            paths::media_binary(4, 2, "gel.png"),
            "resources/000004/v2-gel.png"
        );
        assert_eq!(
            paths::nfs_file(4, "labstore", "/data/../run1/a.csv"),
            "resources/000004/nfs/labstore/data/run1/a.csv"
        );
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(paths::sanitize_segment("a/b"), "a_b");
        assert_eq!(paths::sanitize_segment(".."), "_");
        assert_eq!(paths::sanitize_segment("plain.txt"), "plain.txt");
    }

    #[test]
    fn test_unit_type_from_kind() {
        assert_eq!(UnitType::from(NodeKind::MediaFile), UnitType::Media);
        assert_eq!(
            UnitType::from(NodeKind::Annotation(AnnotationKind::Sketch)).as_str(),
            "annotation"
        );
    }

    #[test]
    fn test_unit_link_json() {
        let json = serde_json::to_string(&UnitLink::Ref(5)).unwrap();
        assert_eq!(json, r#"{"type":"ref","value":5}"#);
    }

    #[test]
    fn test_xxh3_hex() {
        let hash = xxh3_hex(b"hello world");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(xxh3_hex(b"hello world"), xxh3_hex(b"hello world"));
        assert_ne!(xxh3_hex(b"hello"), xxh3_hex(b"world"));
    }
}
