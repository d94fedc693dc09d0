//! Content nodes, revisions and links
//!
//! Every exportable entity is a [`ContentNode`]. The kind-specific payload
//! lives in the closed [`NodeBody`] enum so the bundle format can enumerate
//! every kind explicitly.

use crate::types::{MediaVersionNumber, NodeId, RevisionNumber, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of an annotated element attached to a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    /// Chemical structure drawing
    ChemStructure,
    /// Free-hand sketch
    Sketch,
    /// Mathematical formula
    Formula,
}

/// Discriminant of a content node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Structured document with field values and revision history
    Document,
    /// Plain folder
    Folder,
    /// Ordered notebook of entries
    Notebook,
    /// Binary file in the media gallery
    MediaFile,
    /// Comment on a document
    Comment,
    /// Annotated element inside a document
    Annotation(AnnotationKind),
}

impl NodeKind {
    /// Prefix used in global ids (`SD12`, `FL3`, ...)
    pub fn global_prefix(&self) -> &'static str {
        match self {
            NodeKind::Document => "SD",
            NodeKind::Folder => "FL",
            NodeKind::Notebook => "NB",
            NodeKind::MediaFile => "GL",
            NodeKind::Comment => "CM",
            NodeKind::Annotation(_) => "AN",
        }
    }

    /// Short lowercase name used in bundle file names
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Document => "document",
            NodeKind::Folder => "folder",
            NodeKind::Notebook => "notebook",
            NodeKind::MediaFile => "media",
            NodeKind::Comment => "comment",
            NodeKind::Annotation(_) => "annotation",
        }
    }

    /// Folders and notebooks hold ordered children
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Folder | NodeKind::Notebook)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance-independent textual id of a node, e.g. `SD12`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(String);

impl GlobalId {
    /// Build the global id of a node
    pub fn new(kind: NodeKind, id: NodeId) -> Self {
        GlobalId(format!("{}{}", kind.global_prefix(), id.0))
    }

    /// Parse the numeric part of a global id, ignoring the prefix
    pub fn parse_id(s: &str) -> Option<NodeId> {
        let digits = s.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        if digits.len() == s.len() || digits.is_empty() {
            return None;
        }
        digits.parse().ok().map(NodeId)
    }

    /// Borrow as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One named field value of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name, unique within a document
    pub name: String,
    /// Field content with embedded link tokens (see [`crate::markup`])
    pub content: String,
}

impl Field {
    /// Create a field
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Signing record; freezes the effective revision of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Revision that was current at signing time
    pub revision: RevisionNumber,
    /// Who signed
    pub signer: UserId,
    /// When
    pub signed_at: Timestamp,
}

/// One stored binary of a media file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaVersion {
    /// Version number, ascending
    pub version: MediaVersionNumber,
    /// When this binary replaced the previous one
    pub created_at: Timestamp,
    /// Size in bytes
    pub size: u64,
}

/// Kind-specific payload of a content node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeBody {
    /// Structured document
    Document {
        /// Template this document was created from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template: Option<NodeId>,
        /// Signing record, if signed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<Signature>,
        /// Current field values
        fields: Vec<Field>,
    },
    /// Folder
    Folder,
    /// Notebook
    Notebook,
    /// Media gallery file
    Media {
        /// Original file name including extension
        file_name: String,
        /// MIME type
        content_type: String,
        /// Stored binaries, ascending by version
        versions: Vec<MediaVersion>,
    },
    /// Comment on a document
    Comment {
        /// Comment author (may differ from the document owner)
        author: UserId,
        /// Comment text
        text: String,
    },
    /// Annotated element
    Annotation {
        /// What the element depicts
        kind: AnnotationKind,
        /// Serialized element data (molfile, svg, latex)
        data: String,
    },
}

impl NodeBody {
    /// Kind of node this body belongs to
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeBody::Document { .. } => NodeKind::Document,
            NodeBody::Folder => NodeKind::Folder,
            NodeBody::Notebook => NodeKind::Notebook,
            NodeBody::Media { .. } => NodeKind::MediaFile,
            NodeBody::Comment { .. } => NodeKind::Comment,
            NodeBody::Annotation { kind, .. } => NodeKind::Annotation(*kind),
        }
    }
}

/// Any exportable entity of the content store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentNode {
    /// Identity in the owning instance
    pub id: NodeId,
    /// Display name
    pub name: String,
    /// Owning user
    pub owner: UserId,
    /// Containing folder, notebook or (for comments and annotations) document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    /// Ordering among siblings
    pub position: u32,
    /// Creation time
    pub created_at: Timestamp,
    /// Last modification time
    pub modified_at: Timestamp,
    /// Users who deleted this node from their view
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deleted_for: BTreeSet<UserId>,
    /// Kind-specific payload
    pub body: NodeBody,
}

impl ContentNode {
    /// Node kind
    pub fn kind(&self) -> NodeKind {
        self.body.kind()
    }

    /// Instance-independent id
    pub fn global_id(&self) -> GlobalId {
        GlobalId::new(self.kind(), self.id)
    }

    /// Deleted by its owner: never exportable by anyone
    pub fn is_deleted_by_owner(&self) -> bool {
        self.deleted_for.contains(&self.owner)
    }

    /// Hidden from `user`, either through their own deletion or the owner's
    pub fn is_deleted_for(&self, user: UserId) -> bool {
        self.is_deleted_by_owner() || self.deleted_for.contains(&user)
    }

    /// Signing record of a document
    pub fn signature(&self) -> Option<&Signature> {
        match &self.body {
            NodeBody::Document { signature, .. } => signature.as_ref(),
            _ => None,
        }
    }

    /// Template provenance of a document
    pub fn template(&self) -> Option<NodeId> {
        match &self.body {
            NodeBody::Document { template, .. } => *template,
            _ => None,
        }
    }

    /// Binary versions of a media file (empty for other kinds)
    pub fn media_versions(&self) -> &[MediaVersion] {
        match &self.body {
            NodeBody::Media { versions, .. } => versions,
            _ => &[],
        }
    }
}

/// Immutable snapshot of a document's field values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Owning document
    pub document: NodeId,
    /// Revision number, ascending
    pub number: RevisionNumber,
    /// Who made this revision
    pub modifier: UserId,
    /// When it became current
    pub modified_at: Timestamp,
    /// Field values as of this revision
    pub fields: Vec<Field>,
}

/// What a link expresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Hyperlink written into field content
    Hyperlink,
    /// Media embedded in field content
    Attachment,
    /// Document was created from a template
    TemplateProvenance,
}

/// How a link is represented in an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPolicy {
    /// Target is part of the archive; link becomes bundle-local
    Follow,
    /// Target is not part of the archive; link becomes an absolute URL
    External,
}

/// Directed edge between two content nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    /// Node whose content holds the link
    pub source: NodeId,
    /// Linked node
    pub target: NodeId,
    /// Link kind
    pub kind: LinkKind,
    /// Resolution policy computed at walk time
    pub policy: LinkPolicy,
}
