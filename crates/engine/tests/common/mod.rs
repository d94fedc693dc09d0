//! Shared fixtures for the engine integration suites.
//!
//! Import via `mod common;` from any test file.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use folio_bundle::{
    ArchiveBundle, ArchiveContents, ArchiveReader, NodeUnit, RevisionUnit, UnitBody,
};
pub use folio_core::{
    ArchiveError, ContentNode, ContentStore, ExportConfig, Field, Identity, ImportConfig,
    JobStatus, NodeBody, NodeId, NodeKind, UserId,
};
pub use folio_engine::memory::{AllowAll, MemoryContentStore, MemoryFilestore, RecordingSink};
pub use folio_engine::{ArchiveEngine, CancellationToken, EngineConfig, ExportScope, ImportReport};
use tempfile::TempDir;

pub const SOURCE_URL: &str = "https://source.example.org";
pub const TARGET_URL: &str = "https://target.example.org";

// ============================================================================
// Instance - one store with its engine
// ============================================================================

/// A content store, an engine over it, and a scratch archive directory.
pub struct Instance {
    pub store: Arc<MemoryContentStore>,
    pub filestore: Arc<MemoryFilestore>,
    pub sink: Arc<RecordingSink>,
    pub engine: Arc<ArchiveEngine>,
    pub dir: TempDir,
}

impl Instance {
    /// Instance with default settings, everyone may read everything.
    pub fn new(url: &str) -> Self {
        Self::with_config(url, |c| c)
    }

    /// Instance with adjusted engine settings.
    pub fn with_config(url: &str, adjust: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = Arc::new(MemoryContentStore::new());
        let filestore = Arc::new(MemoryFilestore::new());
        let sink = Arc::new(RecordingSink::new());
        let config =
            adjust(EngineConfig::with_archive_dir(dir.path().join("archives")).instance_url(url));
        let engine = ArchiveEngine::builder(store.clone(), Arc::new(AllowAll))
            .filestore(filestore.clone())
            .notifier(sink.clone())
            .config(config)
            .build()
            .expect("Failed to build engine");
        Instance {
            store,
            filestore,
            sink,
            engine: Arc::new(engine),
            dir,
        }
    }

    /// Register a user and return its identity.
    pub fn user(&self, username: &str) -> Identity {
        let id = self.store.add_user(username);
        self.store.identity(id)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.engine.config().archive_dir.clone()
    }

    /// Export into the archive directory, panicking on failure.
    pub fn export(
        &self,
        identity: &Identity,
        scope: ExportScope,
        config: ExportConfig,
    ) -> ArchiveBundle {
        self.engine
            .export(identity, &scope, &config)
            .expect("export failed")
    }

    /// Import, panicking on a fatal failure.
    pub fn import(&self, identity: &Identity, path: &Path, config: ImportConfig) -> ImportReport {
        self.engine
            .import(identity, path, &config)
            .expect("import failed")
    }

    /// The single node imported from a source node.
    pub fn imported(&self, report: &ImportReport, source: NodeId) -> ContentNode {
        let id = report
            .new_id(source)
            .unwrap_or_else(|| panic!("source node {} was not imported", source));
        self.store.node(id).expect("imported node missing from store")
    }

    /// Stored revisions of a document.
    pub fn revisions(&self, document: NodeId) -> Vec<folio_core::Revision> {
        self.store.revisions_of(document).expect("revisions")
    }

    /// Files left in the archive directory.
    pub fn archive_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.archive_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

// ============================================================================
// Content helpers
// ============================================================================

/// Single-field document content.
pub fn data(content: impl Into<String>) -> Vec<Field> {
    vec![Field::new("data", content)]
}

pub fn link(target: NodeId) -> String {
    format!("{{{{link:{}}}}}", target)
}

pub fn attachment(media: NodeId) -> String {
    format!("{{{{attachment:{}}}}}", media)
}

pub fn pinned_attachment(media: NodeId, version: u32) -> String {
    format!("{{{{attachment:{}@{}}}}}", media, version)
}

pub fn nfs(filestore: &str, path: &str) -> String {
    format!("{{{{nfs:{}:{}}}}}", filestore, path)
}

/// Content of a node's first field.
pub fn field_content(node: &ContentNode) -> String {
    match &node.body {
        NodeBody::Document { fields, .. } => fields
            .first()
            .map(|f| f.content.clone())
            .unwrap_or_default(),
        other => panic!("expected a document, got {:?}", other.kind()),
    }
}

/// Read back a structured archive.
pub fn read(bundle: &ArchiveBundle) -> ArchiveContents {
    ArchiveReader::read_all(&bundle.path).expect("archive unreadable")
}

/// The node unit exported for a source node.
pub fn unit_for(contents: &ArchiveContents, source: NodeId) -> &NodeUnit {
    contents
        .nodes
        .iter()
        .find(|u| u.source_id == source)
        .unwrap_or_else(|| panic!("no unit for source node {}", source))
}

/// Revision units of a document unit, ascending by number.
pub fn revision_units<'c>(
    contents: &'c ArchiveContents,
    document_seq: u64,
) -> Vec<&'c RevisionUnit> {
    let mut units: Vec<&RevisionUnit> = contents
        .revisions
        .iter()
        .filter(|r| r.document_seq == document_seq)
        .collect();
    units.sort_by_key(|r| r.number);
    units
}

/// Every file of an archive, keyed by path below `archive/`.
pub fn extract_files(path: &Path) -> std::collections::BTreeMap<String, Vec<u8>> {
    use std::io::Read;
    let file = std::fs::File::open(path).expect("open archive");
    let decoder = zstd::stream::read::Decoder::new(file).expect("zstd decoder");
    let mut archive = tar::Archive::new(decoder);
    let mut files = std::collections::BTreeMap::new();
    for entry in archive.entries().expect("tar entries") {
        let mut entry = entry.expect("tar entry");
        let name = entry.path().expect("entry path").to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).expect("entry data");
        let rel = name.strip_prefix("archive/").unwrap_or(&name).to_string();
        files.insert(rel, data);
    }
    files
}

// ============================================================================
// GatedStore - holds the first read until released
// ============================================================================

/// Store wrapper whose first `get` blocks until [`GatedStore::open`] is called.
///
/// Lets a test act on a running background job at a known point.
pub struct GatedStore {
    pub inner: Arc<MemoryContentStore>,
    gate: parking_lot::Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    opener: parking_lot::Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryContentStore>) -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        GatedStore {
            inner,
            gate: parking_lot::Mutex::new(Some(rx)),
            opener: parking_lot::Mutex::new(Some(tx)),
        }
    }

    /// Release the blocked read.
    pub fn open(&self) {
        if let Some(tx) = self.opener.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl ContentStore for GatedStore {
    fn get(&self, id: NodeId) -> folio_core::StoreResult<Option<ContentNode>> {
        let gate = self.gate.lock().take();
        if let Some(rx) = gate {
            let _ = rx.recv();
        }
        self.inner.get(id)
    }

    fn children_of(&self, parent: NodeId) -> folio_core::StoreResult<Vec<NodeId>> {
        self.inner.children_of(parent)
    }

    fn revisions_of(&self, document: NodeId) -> folio_core::StoreResult<Vec<folio_core::Revision>> {
        self.inner.revisions_of(document)
    }

    fn media_binary(
        &self,
        media: NodeId,
        version: folio_core::MediaVersionNumber,
    ) -> folio_core::StoreResult<Option<Vec<u8>>> {
        self.inner.media_binary(media, version)
    }

    fn user(&self, id: UserId) -> folio_core::StoreResult<Option<folio_core::User>> {
        self.inner.user(id)
    }

    fn user_by_name(&self, username: &str) -> folio_core::StoreResult<Option<folio_core::User>> {
        self.inner.user_by_name(username)
    }

    fn group(&self, id: folio_core::GroupId) -> folio_core::StoreResult<Option<folio_core::Group>> {
        self.inner.group(id)
    }

    fn group_by_name(&self, name: &str) -> folio_core::StoreResult<Option<folio_core::Group>> {
        self.inner.group_by_name(name)
    }

    fn home_folder(&self, user: UserId) -> folio_core::StoreResult<Option<NodeId>> {
        self.inner.home_folder(user)
    }

    fn reserve_id(&self) -> folio_core::StoreResult<NodeId> {
        self.inner.reserve_id()
    }

    fn commit_node(&self, commit: folio_core::NodeCommit) -> folio_core::StoreResult<()> {
        self.inner.commit_node(commit)
    }

    fn create_user(&self, user: folio_core::NewUser) -> folio_core::StoreResult<folio_core::User> {
        self.inner.create_user(user)
    }

    fn create_group(
        &self,
        name: &str,
        members: &[UserId],
        pis: &[UserId],
    ) -> folio_core::StoreResult<folio_core::Group> {
        self.inner.create_group(name, members, pis)
    }
}

// ============================================================================
// CancellingStore - cancels a job once a node is committed
// ============================================================================

/// Store wrapper that fires a cancellation token after the first successful commit.
pub struct CancellingStore {
    pub inner: Arc<MemoryContentStore>,
    pub token: CancellationToken,
}

impl ContentStore for CancellingStore {
    fn get(&self, id: NodeId) -> folio_core::StoreResult<Option<ContentNode>> {
        self.inner.get(id)
    }

    fn children_of(&self, parent: NodeId) -> folio_core::StoreResult<Vec<NodeId>> {
        self.inner.children_of(parent)
    }

    fn revisions_of(&self, document: NodeId) -> folio_core::StoreResult<Vec<folio_core::Revision>> {
        self.inner.revisions_of(document)
    }

    fn media_binary(
        &self,
        media: NodeId,
        version: folio_core::MediaVersionNumber,
    ) -> folio_core::StoreResult<Option<Vec<u8>>> {
        self.inner.media_binary(media, version)
    }

    fn user(&self, id: UserId) -> folio_core::StoreResult<Option<folio_core::User>> {
        self.inner.user(id)
    }

    fn user_by_name(&self, username: &str) -> folio_core::StoreResult<Option<folio_core::User>> {
        self.inner.user_by_name(username)
    }

    fn group(&self, id: folio_core::GroupId) -> folio_core::StoreResult<Option<folio_core::Group>> {
        self.inner.group(id)
    }

    fn group_by_name(&self, name: &str) -> folio_core::StoreResult<Option<folio_core::Group>> {
        self.inner.group_by_name(name)
    }

    fn home_folder(&self, user: UserId) -> folio_core::StoreResult<Option<NodeId>> {
        self.inner.home_folder(user)
    }

    fn reserve_id(&self) -> folio_core::StoreResult<NodeId> {
        self.inner.reserve_id()
    }

    fn commit_node(&self, commit: folio_core::NodeCommit) -> folio_core::StoreResult<()> {
        self.inner.commit_node(commit)?;
        self.token.cancel();
        Ok(())
    }

    fn create_user(&self, user: folio_core::NewUser) -> folio_core::StoreResult<folio_core::User> {
        self.inner.create_user(user)
    }

    fn create_group(
        &self,
        name: &str,
        members: &[UserId],
        pis: &[UserId],
    ) -> folio_core::StoreResult<folio_core::Group> {
        self.inner.create_group(name, members, pis)
    }
}
