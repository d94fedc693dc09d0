//! Importer / merge engine
//!
//! Rebuilds the content of a structured archive in a target store. An
//! import runs through [`ImportPhase`]s:
//!
//! 1. **Parsing**: the archive is read and checksum-verified, then its
//!    internal references are checked. Any dangling reference, parent cycle
//!    or instance-local id fails the whole import before anything is
//!    written.
//! 2. **Validating**: bundle usernames are resolved against the target
//!    instance according to [`ImportScope`]. Nodes that cannot be placed
//!    are rejected together with their descendants.
//! 3. **Materializing**: every accepted node gets a fresh id, parents
//!    before children. Revisions and media binaries are renumbered from 1
//!    in their original order. The resulting [`IdMap`] is append-only.
//! 4. **Linking**: bundle-local tokens and absolute URLs pointing into the
//!    bundle are rewritten to the new ids, and each node is committed
//!    atomically with its history. Independent subtrees commit in parallel.
//!
//! Per-node failures land in [`ImportReport::errors`]; the other nodes are
//! still committed.

use crate::job::CancellationToken;
use folio_bundle::{
    ArchiveContents, GroupRecord, NodeUnit, RevisionUnit, UnitBody, UnitLink, UserRecord,
};
use folio_core::markup::{self, Token};
use folio_core::{
    ArchiveError, ContentNode, ContentStore, Field, Identity, ImportConfig, ImportScope,
    MediaVersion, MediaVersionNumber, NewUser, NodeBody, NodeCommit, NodeId, NodeKind, Result,
    Revision, RevisionNumber, Signature, UserId,
};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

/// Stage of an import job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    /// Reading and checking the archive
    Parsing,
    /// Resolving users and groups
    Validating,
    /// Reserving ids
    Materializing,
    /// Rewriting references and committing nodes
    Linking,
    /// Finished; per-node errors may exist
    Completed,
    /// Stopped by cancellation while committing; `imported` lists what was kept
    Cancelled,
    /// Aborted by a fatal error
    Failed,
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportPhase::Parsing => "parsing",
            ImportPhase::Validating => "validating",
            ImportPhase::Materializing => "materializing",
            ImportPhase::Linking => "linking",
            ImportPhase::Completed => "completed",
            ImportPhase::Cancelled => "cancelled",
            ImportPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A node created by an import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedRecord {
    /// Sequence number in the bundle
    pub seq: u64,
    /// Id in the source instance
    pub source_id: NodeId,
    /// Id in the target instance
    pub new_id: NodeId,
    /// Node kind
    pub kind: NodeKind,
    /// Node name
    pub name: String,
}

/// A node that was not imported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportItemError {
    /// Sequence number in the bundle
    pub seq: u64,
    /// Id in the source instance
    pub source_id: NodeId,
    /// Node kind
    pub kind: NodeKind,
    /// Why it was not imported
    pub reason: String,
}

impl ImportItemError {
    fn new(unit: &NodeUnit, reason: impl Into<String>) -> Self {
        Self {
            seq: unit.seq,
            source_id: unit.source_id,
            kind: unit.kind(),
            reason: reason.into(),
        }
    }

    /// This failure as an [`ArchiveError`]
    pub fn as_error(&self) -> ArchiveError {
        ArchiveError::EntityMaterializationFailed {
            entity: format!("unit {} (source id {})", self.seq, self.source_id),
            kind: self.kind,
            reason: self.reason.clone(),
        }
    }
}

/// Outcome of one import job
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    /// Last phase reached
    pub phase: ImportPhase,
    /// Created nodes, ascending by bundle sequence number
    pub imported: Vec<ImportedRecord>,
    /// Nodes that were rejected or failed to commit
    pub errors: Vec<ImportItemError>,
    /// Non-fatal adjustments (dropped signatures, users that could not be created)
    pub warnings: Vec<String>,
    /// Usernames created in the target instance
    pub users_created: Vec<String>,
    /// Group names created in the target instance
    pub groups_created: Vec<String>,
    /// Number of revisions written
    pub revisions_imported: usize,
}

impl Default for ImportReport {
    fn default() -> Self {
        Self {
            phase: ImportPhase::Parsing,
            imported: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            users_created: Vec::new(),
            groups_created: Vec::new(),
            revisions_imported: 0,
        }
    }
}

impl ImportReport {
    /// Whether every node of the bundle was imported
    pub fn success(&self) -> bool {
        self.phase == ImportPhase::Completed && self.errors.is_empty()
    }

    /// New id of a node, by its id in the source instance
    pub fn new_id(&self, source: NodeId) -> Option<NodeId> {
        self.imported
            .iter()
            .find(|r| r.source_id == source)
            .map(|r| r.new_id)
    }

    /// Created node of a bundle unit
    pub fn record(&self, seq: u64) -> Option<&ImportedRecord> {
        self.imported.iter().find(|r| r.seq == seq)
    }
}

/// Bundle sequence numbers → target identities
///
/// Entries are only ever added; remapping a sequence number is an error.
#[derive(Debug, Default)]
pub struct IdMap {
    nodes: BTreeMap<u64, NodeId>,
    revisions: BTreeMap<u64, RevisionNumber>,
    media: BTreeMap<(u64, MediaVersionNumber), MediaVersionNumber>,
}

impl IdMap {
    /// Record the new id of a node unit
    pub fn insert_node(&mut self, seq: u64, id: NodeId) -> Result<()> {
        append(&mut self.nodes, seq, id)
    }

    /// Record the new number of a revision unit
    pub fn insert_revision(&mut self, seq: u64, number: RevisionNumber) -> Result<()> {
        append(&mut self.revisions, seq, number)
    }

    /// Record the new number of a media binary
    pub fn insert_media_version(
        &mut self,
        seq: u64,
        version: MediaVersionNumber,
        new_version: MediaVersionNumber,
    ) -> Result<()> {
        append(&mut self.media, (seq, version), new_version)
    }

    /// New id of a node unit
    pub fn node(&self, seq: u64) -> Option<NodeId> {
        self.nodes.get(&seq).copied()
    }

    /// New number of a revision unit
    pub fn revision(&self, seq: u64) -> Option<RevisionNumber> {
        self.revisions.get(&seq).copied()
    }

    /// New number of a media binary
    pub fn media_version(
        &self,
        seq: u64,
        version: MediaVersionNumber,
    ) -> Option<MediaVersionNumber> {
        self.media.get(&(seq, version)).copied()
    }

    /// Number of mapped nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is mapped
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn append<K: Ord + fmt::Debug, V>(map: &mut BTreeMap<K, V>, key: K, value: V) -> Result<()> {
    match map.entry(key) {
        Entry::Occupied(e) => Err(ArchiveError::internal(format!(
            "{:?} mapped twice",
            e.key()
        ))),
        Entry::Vacant(e) => {
            e.insert(value);
            Ok(())
        }
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Checked view of an archive's units
struct BundleIndex<'c> {
    contents: &'c ArchiveContents,
    nodes: HashMap<u64, &'c NodeUnit>,
    /// Revision units per document unit, ascending by number
    revisions: HashMap<u64, Vec<&'c RevisionUnit>>,
    by_global_id: HashMap<&'c str, u64>,
    /// Node units grouped by top-level ancestor, parents before children
    subtrees: Vec<Vec<u64>>,
    /// `<source instance>/globalId/`
    url_prefix: String,
}

impl<'c> BundleIndex<'c> {
    fn build(contents: &'c ArchiveContents) -> Result<Self> {
        let mut nodes = HashMap::with_capacity(contents.nodes.len());
        for unit in &contents.nodes {
            if nodes.insert(unit.seq, unit).is_some() {
                return Err(ArchiveError::malformed(format!("unit {} appears twice", unit.seq)));
            }
        }

        let mut revisions: HashMap<u64, Vec<&RevisionUnit>> = HashMap::new();
        let mut revision_seqs = HashSet::new();
        for rev in &contents.revisions {
            if nodes.contains_key(&rev.seq) || !revision_seqs.insert(rev.seq) {
                return Err(ArchiveError::malformed(format!(
                    "sequence number {} is used twice",
                    rev.seq
                )));
            }
            match nodes.get(&rev.document_seq) {
                Some(doc) if doc.kind() == NodeKind::Document => {}
                _ => {
                    return Err(ArchiveError::malformed(format!(
                        "revision unit {} belongs to unit {}, which is not a document",
                        rev.seq, rev.document_seq
                    )))
                }
            }
            revisions.entry(rev.document_seq).or_default().push(rev);
        }
        for (doc, list) in revisions.iter_mut() {
            list.sort_by_key(|r| r.number);
            if list.windows(2).any(|w| w[0].number == w[1].number) {
                return Err(ArchiveError::malformed(format!(
                    "document unit {} holds a revision number twice",
                    doc
                )));
            }
        }

        for unit in &contents.nodes {
            check_unit(unit, &nodes, &revisions, contents)?;
        }
        for rev in &contents.revisions {
            check_tokens(rev, &nodes)?;
        }

        let subtrees = topological_subtrees(&contents.nodes, nodes.len())?;
        let by_global_id = contents
            .nodes
            .iter()
            .map(|u| (u.global_id.as_str(), u.seq))
            .collect();

        Ok(Self {
            contents,
            nodes,
            revisions,
            by_global_id,
            subtrees,
            url_prefix: format!(
                "{}/globalId/",
                contents.manifest.source_instance.trim_end_matches('/')
            ),
        })
    }

    fn revisions_of(&self, document: u64) -> &[&'c RevisionUnit] {
        self.revisions
            .get(&document)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn check_unit(
    unit: &NodeUnit,
    nodes: &HashMap<u64, &NodeUnit>,
    revisions: &HashMap<u64, Vec<&RevisionUnit>>,
    contents: &ArchiveContents,
) -> Result<()> {
    if let Some(parent) = unit.parent_seq {
        if parent == unit.seq || !nodes.contains_key(&parent) {
            return Err(ArchiveError::malformed(format!(
                "unit {} has unknown parent {}",
                unit.seq, parent
            )));
        }
    }
    match &unit.body {
        UnitBody::Document {
            template,
            signature,
            revisions: listed,
        } => {
            let held: BTreeSet<u64> = revisions
                .get(&unit.seq)
                .map(|l| l.iter().map(|r| r.seq).collect())
                .unwrap_or_default();
            let listed: BTreeSet<u64> = listed.iter().copied().collect();
            if held != listed {
                return Err(ArchiveError::malformed(format!(
                    "document unit {} lists revisions {:?} but the archive holds {:?}",
                    unit.seq, listed, held
                )));
            }
            if let Some(sig) = signature {
                if !listed.contains(&sig.revision_seq) {
                    return Err(ArchiveError::malformed(format!(
                        "document unit {} is signed at unknown revision unit {}",
                        unit.seq, sig.revision_seq
                    )));
                }
            }
            if let Some(UnitLink::Ref(target)) = template {
                if !nodes.contains_key(target) {
                    return Err(ArchiveError::malformed(format!(
                        "document unit {} names unknown template unit {}",
                        unit.seq, target
                    )));
                }
            }
        }
        UnitBody::Media { versions, .. } => {
            for v in versions {
                if contents.file(&v.path).is_none() {
                    return Err(ArchiveError::malformed(format!(
                        "binary {} of unit {} is missing",
                        v.path, unit.seq
                    )));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_tokens(rev: &RevisionUnit, nodes: &HashMap<u64, &NodeUnit>) -> Result<()> {
    for field in &rev.fields {
        for token in markup::tokens(&field.content) {
            let valid = match &token {
                Token::Ref(seq) => nodes.contains_key(seq),
                Token::Media { seq, .. } => nodes
                    .get(seq)
                    .is_some_and(|u| u.kind() == NodeKind::MediaFile),
                Token::Link(_) | Token::Attachment { .. } => false,
                Token::Nfs { .. } | Token::Url(_) => true,
            };
            if !valid {
                return Err(ArchiveError::malformed(format!(
                    "revision unit {} holds unresolvable reference {}",
                    rev.seq, token
                )));
            }
        }
    }
    Ok(())
}

/// Group units under their top-level ancestors in breadth-first order
fn topological_subtrees(units: &[NodeUnit], expected: usize) -> Result<Vec<Vec<u64>>> {
    let mut children: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    let mut roots = BTreeSet::new();
    for unit in units {
        match unit.parent_seq {
            Some(parent) => children.entry(parent).or_default().push(unit.seq),
            None => {
                roots.insert(unit.seq);
            }
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut subtrees = Vec::with_capacity(roots.len());
    let mut placed = 0;
    for root in roots {
        let mut subtree = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(seq) = queue.pop_front() {
            subtree.push(seq);
            if let Some(kids) = children.get(&seq) {
                queue.extend(kids.iter().copied());
            }
        }
        placed += subtree.len();
        subtrees.push(subtree);
    }
    if placed != expected {
        return Err(ArchiveError::malformed("parent references form a cycle"));
    }
    Ok(subtrees)
}

// =============================================================================
// Validating
// =============================================================================

/// How one bundle username resolved for one role
enum Resolution {
    User(UserId),
    Rejected(String),
}

/// Bundle usernames → target users, creating accounts when allowed
struct Directory<'a> {
    store: &'a dyn ContentStore,
    config: &'a ImportConfig,
    requester: UserId,
    records: HashMap<&'a str, &'a UserRecord>,
    cache: HashMap<String, Option<UserId>>,
    created: Vec<String>,
    warnings: Vec<String>,
}

impl<'a> Directory<'a> {
    fn new(
        store: &'a dyn ContentStore,
        config: &'a ImportConfig,
        requester: UserId,
        records: &'a [UserRecord],
    ) -> Self {
        Self {
            store,
            config,
            requester,
            records: records.iter().map(|r| (r.username.as_str(), r)).collect(),
            cache: HashMap::new(),
            created: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn mapped(&self, username: &str) -> Option<&'a String> {
        self.config.owner_mapping.get(username)
    }

    fn lookup(&mut self, username: &str) -> Result<Option<UserId>> {
        let target = self
            .mapped(username)
            .cloned()
            .unwrap_or_else(|| username.to_string());
        if let Some(hit) = self.cache.get(&target) {
            return Ok(*hit);
        }
        let found = match self.store.user_by_name(&target)? {
            Some(user) => Some(user.id),
            None if self.config.scope == ImportScope::CreateUsers => self.create(username, &target),
            None => None,
        };
        self.cache.insert(target, found);
        Ok(found)
    }

    fn create(&mut self, source: &str, target: &str) -> Option<UserId> {
        let record = self.records.get(source).copied();
        let new_user = NewUser {
            username: target.to_string(),
            display_name: record
                .map(|r| r.display_name.clone())
                .unwrap_or_else(|| target.to_string()),
            email: record.and_then(|r| r.email.clone()),
        };
        match self.store.create_user(new_user) {
            Ok(user) => {
                info!(target: "folio::import", username = %user.username, "Created user");
                self.created.push(user.username);
                Some(user.id)
            }
            Err(e) => {
                warn!(
                    target: "folio::import",
                    username = target,
                    error = %e,
                    "User creation failed"
                );
                self.warnings
                    .push(format!("user '{}' could not be created: {}", target, e));
                None
            }
        }
    }

    fn owner(&mut self, username: &str) -> Result<Resolution> {
        if let Some(id) = self.lookup(username)? {
            return Ok(Resolution::User(id));
        }
        Ok(match (self.config.scope, self.mapped(username)) {
            (_, Some(target)) => Resolution::Rejected(format!(
                "owner '{}' is mapped to unknown user '{}'",
                username, target
            )),
            (ImportScope::IgnoreUsers, None) => Resolution::User(self.requester),
            (ImportScope::CreateUsers, None) => {
                Resolution::Rejected(format!("owner '{}' could not be created", username))
            }
        })
    }

    fn author(&mut self, username: &str) -> Result<Resolution> {
        Ok(match self.lookup(username)? {
            Some(id) => Resolution::User(id),
            None => Resolution::Rejected(format!(
                "comment author '{}' cannot be resolved",
                username
            )),
        })
    }

    fn modifier(&mut self, username: &str) -> Result<UserId> {
        Ok(self.lookup(username)?.unwrap_or(self.requester))
    }

    fn create_groups(&mut self, groups: &[GroupRecord]) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for group in groups {
            if self.store.group_by_name(&group.name)?.is_some() {
                continue;
            }
            let mut members = Vec::with_capacity(group.members.len());
            for name in &group.members {
                members.extend(self.lookup(name)?);
            }
            let mut pis = Vec::with_capacity(group.pis.len());
            for name in &group.pis {
                pis.extend(self.lookup(name)?);
            }
            match self.store.create_group(&group.name, &members, &pis) {
                Ok(g) => {
                    info!(target: "folio::import", group = %g.name, "Created group");
                    created.push(g.name);
                }
                Err(e) => self
                    .warnings
                    .push(format!("group '{}' could not be created: {}", group.name, e)),
            }
        }
        Ok(created)
    }
}

/// Target users of one accepted node
#[derive(Debug, Clone, Copy)]
struct Accepted {
    owner: UserId,
    author: Option<UserId>,
    signer: Option<UserId>,
}

enum Verdict {
    Accept(Accepted),
    Reject(String),
}

// =============================================================================
// Linking
// =============================================================================

enum NodeOutcome {
    Imported(ImportedRecord, usize),
    Failed(ImportItemError),
    Cancelled(ImportItemError),
}

/// Builds node commits with references rewritten to target ids
struct Linker<'a, 'c> {
    index: &'a BundleIndex<'c>,
    ids: &'a IdMap,
    accepted: &'a HashMap<u64, Accepted>,
    modifiers: &'a HashMap<String, UserId>,
    target_folder: Option<NodeId>,
}

impl Linker<'_, '_> {
    fn commit_for(&self, unit: &NodeUnit, id: NodeId) -> std::result::Result<NodeCommit, String> {
        let accepted = self
            .accepted
            .get(&unit.seq)
            .ok_or_else(|| format!("unit {} was not validated", unit.seq))?;
        let parent = match unit.parent_seq {
            Some(p) => Some(
                self.ids
                    .node(p)
                    .ok_or_else(|| format!("parent unit {} has no id", p))?,
            ),
            None => self.target_folder,
        };

        let mut revisions = Vec::new();
        let mut binaries = Vec::new();
        let body = match &unit.body {
            UnitBody::Document {
                template,
                signature,
                ..
            } => {
                for rev in self.index.revisions_of(unit.seq) {
                    revisions.push(Revision {
                        document: id,
                        number: self
                            .ids
                            .revision(rev.seq)
                            .ok_or_else(|| format!("revision unit {} has no number", rev.seq))?,
                        modifier: self
                            .modifiers
                            .get(&rev.modifier)
                            .copied()
                            .unwrap_or(accepted.owner),
                        modified_at: rev.modified_at,
                        fields: self.link_fields(&rev.fields),
                    });
                }
                NodeBody::Document {
                    template: template.as_ref().and_then(|t| self.link_target(t)),
                    signature: match (signature, accepted.signer) {
                        (Some(sig), Some(signer)) => {
                            self.ids.revision(sig.revision_seq).map(|revision| Signature {
                                revision,
                                signer,
                                signed_at: sig.signed_at,
                            })
                        }
                        _ => None,
                    },
                    fields: revisions.last().map(|r| r.fields.clone()).unwrap_or_default(),
                }
            }
            UnitBody::Folder => NodeBody::Folder,
            UnitBody::Notebook => NodeBody::Notebook,
            UnitBody::Media {
                file_name,
                content_type,
                versions,
            } => {
                let mut ordered: Vec<_> = versions.iter().collect();
                ordered.sort_by_key(|v| v.version);
                let mut kept = Vec::with_capacity(ordered.len());
                for v in ordered {
                    let version = self
                        .ids
                        .media_version(unit.seq, v.version)
                        .ok_or_else(|| format!("binary version {} has no number", v.version))?;
                    let data = self
                        .index
                        .contents
                        .file(&v.path)
                        .ok_or_else(|| format!("binary {} is missing", v.path))?
                        .to_vec();
                    kept.push(MediaVersion {
                        version,
                        created_at: v.created_at,
                        size: data.len() as u64,
                    });
                    binaries.push((version, data));
                }
                NodeBody::Media {
                    file_name: file_name.clone(),
                    content_type: content_type.clone(),
                    versions: kept,
                }
            }
            UnitBody::Comment { text, .. } => NodeBody::Comment {
                author: accepted.author.unwrap_or(accepted.owner),
                text: text.clone(),
            },
            UnitBody::Annotation { kind, data } => NodeBody::Annotation {
                kind: *kind,
                data: data.clone(),
            },
        };

        Ok(NodeCommit {
            node: ContentNode {
                id,
                name: unit.name.clone(),
                owner: accepted.owner,
                parent,
                position: unit.position,
                created_at: unit.created_at,
                modified_at: unit.modified_at,
                deleted_for: BTreeSet::new(),
                body,
            },
            revisions,
            binaries,
        })
    }

    fn link_fields(&self, fields: &[Field]) -> Vec<Field> {
        fields
            .iter()
            .map(|f| Field {
                name: f.name.clone(),
                content: markup::rewrite_tokens(&f.content, |t| self.link_token(t)),
            })
            .collect()
    }

    fn link_token(&self, token: &Token) -> Token {
        match token {
            Token::Ref(seq) => match self.ids.node(*seq) {
                Some(id) => Token::Link(id),
                None => self.source_url(*seq).unwrap_or_else(|| token.clone()),
            },
            Token::Media { seq, version } => match self.ids.node(*seq) {
                Some(media) => Token::Attachment {
                    media,
                    version: self.ids.media_version(*seq, *version),
                },
                None => self.source_url(*seq).unwrap_or_else(|| token.clone()),
            },
            Token::Url(url) => match self.bundle_target(url) {
                Some(id) => Token::Link(id),
                None => token.clone(),
            },
            other => other.clone(),
        }
    }

    fn link_target(&self, link: &UnitLink) -> Option<NodeId> {
        match link {
            UnitLink::Ref(seq) => self.ids.node(*seq),
            UnitLink::Url(url) => self.bundle_target(url),
        }
    }

    /// Imported node an absolute source-instance URL points at
    fn bundle_target(&self, url: &str) -> Option<NodeId> {
        let global_id = url.strip_prefix(&self.index.url_prefix)?;
        let seq = self.index.by_global_id.get(global_id)?;
        self.ids.node(*seq)
    }

    /// Source-instance URL of a unit that was not imported
    fn source_url(&self, seq: u64) -> Option<Token> {
        self.index
            .nodes
            .get(&seq)
            .map(|u| Token::Url(format!("{}{}", self.index.url_prefix, u.global_id)))
    }
}

// =============================================================================
// Importer
// =============================================================================

/// Imports one structured archive
pub struct Importer<'a> {
    store: &'a dyn ContentStore,
    identity: &'a Identity,
    config: &'a ImportConfig,
    cancel: &'a CancellationToken,
}

impl<'a> Importer<'a> {
    /// Importer for one job
    pub fn new(
        store: &'a dyn ContentStore,
        identity: &'a Identity,
        config: &'a ImportConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            identity,
            config,
            cancel,
        }
    }

    /// Import the archive
    ///
    /// Fatal errors (malformed archive, unknown target folder, store
    /// failures outside a node commit) are returned as `Err`, as is a
    /// cancellation before the first commit. A cancellation while committing
    /// returns the report with phase [`ImportPhase::Cancelled`]: committed
    /// nodes stay and are listed, the rest are listed as errors.
    pub fn import(&self, contents: &ArchiveContents) -> Result<ImportReport> {
        let mut report = ImportReport::default();

        let index = BundleIndex::build(contents)?;
        self.check_target_folder()?;
        debug!(
            target: "folio::import",
            source = %contents.manifest.source_instance,
            nodes = contents.nodes.len(),
            revisions = contents.revisions.len(),
            "Archive parsed"
        );

        report.phase = ImportPhase::Validating;
        let mut directory = Directory::new(
            self.store,
            self.config,
            self.identity.user,
            &contents.manifest.users,
        );
        if self.config.scope == ImportScope::CreateUsers {
            report.groups_created = directory.create_groups(&contents.manifest.groups)?;
        }
        let mut accepted: HashMap<u64, Accepted> = HashMap::new();
        let mut modifiers: HashMap<String, UserId> = HashMap::new();
        for subtree in &index.subtrees {
            for &seq in subtree {
                self.cancel.check()?;
                let unit = unit_at(&index, seq)?;
                let verdict = match unit.parent_seq {
                    Some(p) if !accepted.contains_key(&p) => {
                        Verdict::Reject(format!("parent unit {} was not imported", p))
                    }
                    _ => self.validate(unit, &index, &mut directory, &mut modifiers, &mut report)?,
                };
                match verdict {
                    Verdict::Accept(a) => {
                        accepted.insert(seq, a);
                    }
                    Verdict::Reject(reason) => {
                        warn!(target: "folio::import", seq, reason = %reason, "Unit rejected");
                        report.errors.push(ImportItemError::new(unit, reason));
                    }
                }
            }
        }
        report.users_created = std::mem::take(&mut directory.created);
        report.warnings.append(&mut directory.warnings);

        report.phase = ImportPhase::Materializing;
        let mut ids = IdMap::default();
        for subtree in &index.subtrees {
            for &seq in subtree {
                self.cancel.check()?;
                if !accepted.contains_key(&seq) {
                    continue;
                }
                let unit = unit_at(&index, seq)?;
                if let Some(p) = unit.parent_seq {
                    if ids.node(p).is_none() {
                        report.errors.push(ImportItemError::new(
                            unit,
                            format!("parent unit {} could not be created", p),
                        ));
                        continue;
                    }
                }
                match self.store.reserve_id() {
                    Ok(id) => ids.insert_node(seq, id)?,
                    Err(e) => {
                        report.errors.push(ImportItemError::new(unit, e.to_string()));
                        continue;
                    }
                }
                for (i, rev) in index.revisions_of(seq).iter().enumerate() {
                    ids.insert_revision(rev.seq, i as RevisionNumber + 1)?;
                }
                if let UnitBody::Media { versions, .. } = &unit.body {
                    let mut numbers: Vec<MediaVersionNumber> =
                        versions.iter().map(|v| v.version).collect();
                    numbers.sort_unstable();
                    numbers.dedup();
                    for (i, v) in numbers.into_iter().enumerate() {
                        ids.insert_media_version(seq, v, i as MediaVersionNumber + 1)?;
                    }
                }
            }
        }
        debug!(target: "folio::import", reserved = ids.len(), "Ids reserved");

        report.phase = ImportPhase::Linking;
        let linker = Linker {
            index: &index,
            ids: &ids,
            accepted: &accepted,
            modifiers: &modifiers,
            target_folder: self.config.target_folder,
        };
        let commit_subtree = |subtree: &Vec<u64>| self.commit_subtree(subtree, &linker);
        let outcomes: Vec<Vec<NodeOutcome>> = if index.subtrees.len() > 1 {
            index
                .subtrees
                .par_iter()
                .map(commit_subtree)
                .collect::<Result<_>>()?
        } else {
            index
                .subtrees
                .iter()
                .map(commit_subtree)
                .collect::<Result<_>>()?
        };

        let mut cancelled = false;
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                NodeOutcome::Imported(record, revisions) => {
                    report.revisions_imported += revisions;
                    report.imported.push(record);
                }
                NodeOutcome::Failed(error) => report.errors.push(error),
                NodeOutcome::Cancelled(error) => {
                    cancelled = true;
                    report.errors.push(error);
                }
            }
        }
        report.imported.sort_by_key(|r| r.seq);
        report.errors.sort_by_key(|e| e.seq);
        if cancelled {
            report.phase = ImportPhase::Cancelled;
            warn!(
                target: "folio::import",
                imported = report.imported.len(),
                "Import cancelled while committing"
            );
            return Ok(report);
        }
        report.phase = ImportPhase::Completed;

        info!(
            target: "folio::import",
            imported = report.imported.len(),
            failed = report.errors.len(),
            revisions = report.revisions_imported,
            users_created = report.users_created.len(),
            "Import finished"
        );
        Ok(report)
    }

    fn check_target_folder(&self) -> Result<()> {
        let Some(folder) = self.config.target_folder else {
            return Ok(());
        };
        match self.store.get(folder)? {
            Some(node) if node.kind().is_container() => Ok(()),
            Some(node) => Err(ArchiveError::invalid_config(format!(
                "import target {} is a {}, not a folder or notebook",
                folder,
                node.kind()
            ))),
            None => Err(ArchiveError::node_not_found(folder)),
        }
    }

    fn validate(
        &self,
        unit: &NodeUnit,
        index: &BundleIndex<'_>,
        directory: &mut Directory<'_>,
        modifiers: &mut HashMap<String, UserId>,
        report: &mut ImportReport,
    ) -> Result<Verdict> {
        let owner = match directory.owner(&unit.owner)? {
            Resolution::User(id) => id,
            Resolution::Rejected(reason) => return Ok(Verdict::Reject(reason)),
        };

        let mut author = None;
        let mut signer = None;
        match &unit.body {
            UnitBody::Comment { author: name, .. } => match directory.author(name)? {
                Resolution::User(id) => author = Some(id),
                Resolution::Rejected(reason) => return Ok(Verdict::Reject(reason)),
            },
            UnitBody::Document { signature, .. } => {
                if let Some(sig) = signature {
                    signer = directory.lookup(&sig.signer)?;
                    if signer.is_none() {
                        report.warnings.push(format!(
                            "signature of unit {} dropped: signer '{}' is unknown",
                            unit.seq, sig.signer
                        ));
                    }
                }
                for rev in index.revisions_of(unit.seq) {
                    if !modifiers.contains_key(&rev.modifier) {
                        let id = directory.modifier(&rev.modifier)?;
                        modifiers.insert(rev.modifier.clone(), id);
                    }
                }
            }
            _ => {}
        }

        Ok(Verdict::Accept(Accepted {
            owner,
            author,
            signer,
        }))
    }

    fn commit_subtree(&self, subtree: &[u64], linker: &Linker<'_, '_>) -> Result<Vec<NodeOutcome>> {
        let mut failed = HashSet::new();
        let mut outcomes = Vec::with_capacity(subtree.len());
        for &seq in subtree {
            let Some(new_id) = linker.ids.node(seq) else {
                continue;
            };
            let unit = unit_at(linker.index, seq)?;

            if self.cancel.is_cancelled() {
                outcomes.push(NodeOutcome::Cancelled(ImportItemError::new(
                    unit,
                    "not imported: job cancelled",
                )));
                continue;
            }

            if let Some(p) = unit.parent_seq.filter(|p| failed.contains(p)) {
                failed.insert(seq);
                outcomes.push(NodeOutcome::Failed(ImportItemError::new(
                    unit,
                    format!("parent unit {} failed to import", p),
                )));
                continue;
            }

            let committed = linker.commit_for(unit, new_id).and_then(|commit| {
                let revisions = commit.revisions.len();
                self.store
                    .commit_node(commit)
                    .map(|()| revisions)
                    .map_err(|e| e.to_string())
            });
            match committed {
                Ok(revisions) => outcomes.push(NodeOutcome::Imported(
                    ImportedRecord {
                        seq,
                        source_id: unit.source_id,
                        new_id,
                        kind: unit.kind(),
                        name: unit.name.clone(),
                    },
                    revisions,
                )),
                Err(reason) => {
                    warn!(target: "folio::import", seq, reason = %reason, "Node commit failed");
                    failed.insert(seq);
                    outcomes.push(NodeOutcome::Failed(ImportItemError::new(unit, reason)));
                }
            }
        }
        Ok(outcomes)
    }
}

fn unit_at<'c>(index: &BundleIndex<'c>, seq: u64) -> Result<&'c NodeUnit> {
    index
        .nodes
        .get(&seq)
        .copied()
        .ok_or_else(|| ArchiveError::internal(format!("unit {} vanished from the index", seq)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryContentStore;
    use folio_bundle::{ArchiveManifest, UnitSignature};
    use folio_core::ArchiveFormat;

    fn node(seq: u64, parent: Option<u64>, name: &str, body: UnitBody) -> NodeUnit {
        NodeUnit {
            seq,
            source_id: NodeId(seq * 10),
            global_id: format!("SD{}", seq * 10),
            name: name.into(),
            owner: "alice".into(),
            parent_seq: parent,
            position: 0,
            created_at: 1,
            modified_at: 2,
            body,
        }
    }

    fn document(seq: u64, parent: Option<u64>, name: &str, revisions: Vec<u64>) -> NodeUnit {
        node(
            seq,
            parent,
            name,
            UnitBody::Document {
                template: None,
                signature: None,
                revisions,
            },
        )
    }

    fn revision(seq: u64, document_seq: u64, number: u32, content: &str) -> RevisionUnit {
        RevisionUnit {
            seq,
            document_seq,
            number,
            modifier: "alice".into(),
            modified_at: number as i64 * 10,
            effective: true,
            fields: vec![Field::new("data", content)],
        }
    }

    fn contents(nodes: Vec<NodeUnit>, revisions: Vec<RevisionUnit>) -> ArchiveContents {
        ArchiveContents {
            manifest: ArchiveManifest::new(ArchiveFormat::Structured, "http://src", ""),
            nodes,
            revisions,
            files: HashMap::new(),
        }
    }

    fn run(store: &MemoryContentStore, contents: &ArchiveContents) -> Result<ImportReport> {
        let admin = store.add_user("admin");
        let identity = store.identity(admin);
        let config = ImportConfig::ignore_users();
        Importer::new(store, &identity, &config, &CancellationToken::new()).import(contents)
    }

    #[test]
    fn dangling_ref_is_malformed() {
        let bundle = contents(
            vec![document(1, None, "a", vec![2])],
            vec![revision(2, 1, 1, "see {{ref:9}}")],
        );
        let store = MemoryContentStore::new();
        assert!(matches!(run(&store, &bundle), Err(ArchiveError::MalformedBundle(_))));
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn instance_local_link_is_malformed() {
        let bundle = contents(
            vec![document(1, None, "a", vec![2])],
            vec![revision(2, 1, 1, "{{link:4}}")],
        );
        let store = MemoryContentStore::new();
        assert!(matches!(run(&store, &bundle), Err(ArchiveError::MalformedBundle(_))));
    }

    #[test]
    fn parent_cycle_is_malformed() {
        let bundle = contents(
            vec![
                node(1, Some(2), "x", UnitBody::Folder),
                node(2, Some(1), "y", UnitBody::Folder),
            ],
            vec![],
        );
        let store = MemoryContentStore::new();
        let err = run(&store, &bundle).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn revision_list_mismatch_is_malformed() {
        let bundle = contents(
            vec![document(1, None, "a", vec![2, 3])],
            vec![revision(2, 1, 1, "x")],
        );
        let store = MemoryContentStore::new();
        assert!(matches!(run(&store, &bundle), Err(ArchiveError::MalformedBundle(_))));
    }

    #[test]
    fn references_are_rewritten_to_new_ids() {
        let bundle = contents(
            vec![
                node(1, None, "project", UnitBody::Folder),
                document(2, Some(1), "a", vec![3]),
                document(4, Some(1), "b", vec![5]),
            ],
            vec![
                revision(
                    3,
                    2,
                    1,
                    "{{ref:4}} {{url:http://src/globalId/SD40}} {{url:http://other/globalId/SD40}}",
                ),
                revision(5, 4, 1, "plain"),
            ],
        );
        let store = MemoryContentStore::new();
        let report = run(&store, &bundle).unwrap();
        assert!(report.success());

        let b = report.record(4).unwrap().new_id;
        let a = store.node(report.record(2).unwrap().new_id).unwrap();
        let NodeBody::Document { fields, .. } = &a.body else {
            panic!("not a document");
        };
        assert_eq!(
            fields[0].content,
            format!(
                "{{{{link:{}}}}} {{{{link:{}}}}} {{{{url:http://other/globalId/SD40}}}}",
                b, b
            )
        );
        assert_eq!(a.parent, Some(report.record(1).unwrap().new_id));
    }

    #[test]
    fn revisions_are_renumbered_in_order() {
        let bundle = contents(
            vec![document(1, None, "a", vec![2, 3])],
            vec![revision(2, 1, 4, "first"), revision(3, 1, 9, "second")],
        );
        let store = MemoryContentStore::new();
        let report = run(&store, &bundle).unwrap();
        let id = report.record(1).unwrap().new_id;
        let revisions = store.revisions_of(id).unwrap();
        assert_eq!(revisions.iter().map(|r| r.number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(revisions[1].fields[0].content, "second");
        assert_eq!(report.revisions_imported, 2);
    }

    #[test]
    fn unknown_signer_drops_signature_with_warning() {
        let mut doc = document(1, None, "a", vec![2]);
        doc.body = UnitBody::Document {
            template: None,
            signature: Some(UnitSignature {
                revision_seq: 2,
                signer: "ghost".into(),
                signed_at: 5,
            }),
            revisions: vec![2],
        };
        let bundle = contents(vec![doc], vec![revision(2, 1, 1, "x")]);
        let store = MemoryContentStore::new();
        let report = run(&store, &bundle).unwrap();
        assert!(report.success());
        assert!(report.warnings[0].contains("ghost"));
        let created = store.node(report.record(1).unwrap().new_id).unwrap();
        assert!(created.signature().is_none());
    }

    #[test]
    fn id_map_is_append_only() {
        let mut ids = IdMap::default();
        ids.insert_node(1, NodeId(7)).unwrap();
        assert!(ids.insert_node(1, NodeId(8)).is_err());
        assert_eq!(ids.node(1), Some(NodeId(7)));
        assert_eq!(ids.len(), 1);
    }
}
