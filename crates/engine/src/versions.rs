//! Version selection
//!
//! Decides which document revisions and which media binaries an archive
//! carries. A document's effective revision is the signed one when the
//! document is signed, the newest otherwise. Attachments are resolved per
//! revision: an unpinned attachment means "the media binary current when
//! this revision was saved", so an old revision keeps pointing at the old
//! binary after the media file was replaced.

use crate::snapshot::SnapshotReader;
use crate::walker::ClosedSet;
use folio_core::markup::{self, Token};
use folio_core::{
    ContentNode, MediaVersionNumber, NodeBody, NodeId, NodeKind, Result, Revision,
    RevisionNumber, Timestamp,
};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Number of the revision that represents a document
pub fn effective_revision(node: &ContentNode, revisions: &[Revision]) -> Option<RevisionNumber> {
    if let Some(signature) = node.signature() {
        if revisions.iter().any(|r| r.number == signature.revision) {
            return Some(signature.revision);
        }
        warn!(
            target: "folio::export",
            document = %node.id,
            revision = signature.revision,
            "Signed revision missing, using newest"
        );
    }
    revisions.iter().map(|r| r.number).max()
}

/// Revision history of a document, synthesizing one from the current
/// fields when the store keeps no history
pub fn history(node: &ContentNode, revisions: &[Revision]) -> Vec<Revision> {
    if !revisions.is_empty() {
        let mut revisions = revisions.to_vec();
        revisions.sort_by_key(|r| r.number);
        return revisions;
    }
    match &node.body {
        NodeBody::Document { fields, .. } => vec![Revision {
            document: node.id,
            number: 1,
            modifier: node.owner,
            modified_at: node.modified_at,
            fields: fields.clone(),
        }],
        _ => Vec::new(),
    }
}

/// Revisions to serialize: all of them, or only the effective one
pub fn selected_revisions(
    node: &ContentNode,
    revisions: &[Revision],
    include_all_versions: bool,
) -> Vec<Revision> {
    let history = history(node, revisions);
    if include_all_versions {
        return history;
    }
    match effective_revision(node, &history) {
        Some(n) => history.into_iter().filter(|r| r.number == n).collect(),
        None => Vec::new(),
    }
}

/// Binary version an attachment token refers to at a point in time
///
/// A pinned version is kept when the media file has it. Otherwise the
/// newest version created at or before `at` wins, or the earliest version
/// when every version is newer.
pub fn resolve_media_version(
    media: &ContentNode,
    pinned: Option<MediaVersionNumber>,
    at: Timestamp,
) -> Option<MediaVersionNumber> {
    let versions = media.media_versions();
    if let Some(v) = pinned {
        if versions.iter().any(|mv| mv.version == v) {
            return Some(v);
        }
    }
    versions
        .iter()
        .filter(|mv| mv.created_at <= at)
        .max_by_key(|mv| (mv.created_at, mv.version))
        .or_else(|| versions.iter().min_by_key(|mv| mv.version))
        .map(|mv| mv.version)
}

/// One revision chosen for the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRevision {
    /// The revision
    pub revision: Revision,
    /// Whether this is the document's effective revision
    pub effective: bool,
    /// Attachment token `(media, pinned)` → binary version in the archive
    pub attachments: HashMap<(NodeId, Option<MediaVersionNumber>), MediaVersionNumber>,
}

impl SelectedRevision {
    /// Archive version of an attachment token
    pub fn attachment_version(
        &self,
        media: NodeId,
        pinned: Option<MediaVersionNumber>,
    ) -> Option<MediaVersionNumber> {
        self.attachments.get(&(media, pinned)).copied()
    }
}

/// Revisions and binaries selected for every node in a closed set
#[derive(Debug, Clone, Default)]
pub struct VersionPlan {
    documents: HashMap<NodeId, Vec<SelectedRevision>>,
    media: HashMap<NodeId, BTreeSet<MediaVersionNumber>>,
}

impl VersionPlan {
    /// Selected revisions of a document, ascending
    pub fn revisions(&self, document: NodeId) -> &[SelectedRevision] {
        self.documents
            .get(&document)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Binary versions of a media file to embed, ascending
    pub fn media_versions(&self, media: NodeId) -> Vec<MediaVersionNumber> {
        self.media
            .get(&media)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total number of selected revisions
    pub fn revision_count(&self) -> usize {
        self.documents.values().map(Vec::len).sum()
    }
}

/// Builds a [`VersionPlan`] for a closed set
pub struct VersionSelector<'a> {
    snapshot: &'a SnapshotReader,
    include_all_versions: bool,
}

impl<'a> VersionSelector<'a> {
    /// Selector for one job
    pub fn new(snapshot: &'a SnapshotReader, include_all_versions: bool) -> Self {
        Self {
            snapshot,
            include_all_versions,
        }
    }

    /// Select revisions and binaries
    pub fn select(&self, closed: &ClosedSet) -> Result<VersionPlan> {
        let mut plan = VersionPlan::default();

        for walked in closed.nodes() {
            let node = &walked.node;
            if node.kind() != NodeKind::Document {
                continue;
            }
            let stored = self.snapshot.revisions(node.id)?;
            let history = history(node, &stored);
            let effective = effective_revision(node, &history);
            let chosen = selected_revisions(node, &stored, self.include_all_versions);

            let mut selected = Vec::with_capacity(chosen.len());
            for revision in chosen {
                let mut attachments = HashMap::new();
                for field in &revision.fields {
                    for token in markup::tokens(&field.content) {
                        let Token::Attachment { media, version } = token else {
                            continue;
                        };
                        let Some(walked_media) = closed.get(media) else {
                            continue;
                        };
                        if let Some(v) =
                            resolve_media_version(&walked_media.node, version, revision.modified_at)
                        {
                            attachments.insert((media, version), v);
                            plan.media.entry(media).or_default().insert(v);
                        }
                    }
                }
                selected.push(SelectedRevision {
                    effective: Some(revision.number) == effective,
                    revision,
                    attachments,
                });
            }
            plan.documents.insert(node.id, selected);
        }

        for walked in closed.nodes() {
            let versions = walked.node.media_versions();
            if walked.node.kind() != NodeKind::MediaFile || versions.is_empty() {
                continue;
            }
            let entry = plan.media.entry(walked.node.id).or_default();
            if self.include_all_versions {
                entry.extend(versions.iter().map(|v| v.version));
            } else if let Some(latest) = versions.iter().map(|v| v.version).max() {
                entry.insert(latest);
            }
        }

        Ok(plan)
    }
}
