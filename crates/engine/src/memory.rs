//! In-memory collaborators
//!
//! Reference implementations of the collaborator traits. The test-suite
//! builds its fixtures on them, and hosts can use them to try the engine
//! without a real backend.

use folio_core::{
    AnnotationKind, ArchiveError, ContentNode, ContentStore, Field, FilestoreClient,
    FilestoreEntry, Group, GroupId, Identity, JobOutcome, MediaVersion, MediaVersionNumber,
    NewUser, NodeBody, NodeCommit, NodeId, NotificationSink, PermissionOracle, Result, Revision,
    RevisionNumber, Signature, StoreError, StoreResult, Timestamp, User, UserId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct StoreInner {
    nodes: BTreeMap<NodeId, ContentNode>,
    revisions: HashMap<NodeId, Vec<Revision>>,
    binaries: HashMap<(NodeId, MediaVersionNumber), Vec<u8>>,
    users: BTreeMap<UserId, User>,
    groups: BTreeMap<GroupId, Group>,
    homes: HashMap<UserId, NodeId>,
    reserved: HashSet<NodeId>,
    rejected_names: HashSet<String>,
    next_user: u64,
    next_group: u64,
}

impl StoreInner {
    fn next_position(&self, parent: Option<NodeId>) -> u32 {
        match parent {
            Some(p) => self.nodes.values().filter(|n| n.parent == Some(p)).count() as u32,
            None => 0,
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut ContentNode {
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("node {} does not exist", id))
    }
}

/// Content store kept entirely in memory
///
/// The fixture helpers panic on misuse (unknown ids); the trait methods
/// report errors like a real backend would.
pub struct MemoryContentStore {
    inner: RwLock<StoreInner>,
    next_id: AtomicU64,
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContentStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(
        &self,
        parent: Option<NodeId>,
        name: &str,
        owner: UserId,
        at: Timestamp,
        body: NodeBody,
    ) -> NodeId {
        let id = self.allocate();
        let mut inner = self.inner.write();
        let position = inner.next_position(parent);
        inner.nodes.insert(
            id,
            ContentNode {
                id,
                name: name.to_string(),
                owner,
                parent,
                position,
                created_at: at,
                modified_at: at,
                deleted_for: BTreeSet::new(),
                body,
            },
        );
        id
    }

    /// Register a user
    pub fn add_user(&self, username: &str) -> UserId {
        let mut inner = self.inner.write();
        inner.next_user += 1;
        let id = UserId(inner.next_user);
        inner.users.insert(
            id,
            User {
                id,
                username: username.to_string(),
                display_name: username.to_string(),
                email: None,
            },
        );
        id
    }

    /// Identity of a registered user
    pub fn identity(&self, user: UserId) -> Identity {
        let username = self
            .inner
            .read()
            .users
            .get(&user)
            .map(|u| u.username.clone())
            .unwrap_or_default();
        Identity::new(user, username)
    }

    /// Register a group
    pub fn add_group(&self, name: &str, members: &[UserId], pis: &[UserId]) -> GroupId {
        let mut inner = self.inner.write();
        inner.next_group += 1;
        let id = GroupId(inner.next_group);
        inner.groups.insert(
            id,
            Group {
                id,
                name: name.to_string(),
                members: members.to_vec(),
                pis: pis.to_vec(),
            },
        );
        id
    }

    /// Create a user's home folder
    pub fn create_home_folder(&self, user: UserId, at: Timestamp) -> NodeId {
        let id = self.insert(None, "Home", user, at, NodeBody::Folder);
        self.inner.write().homes.insert(user, id);
        id
    }

    /// Create a folder
    pub fn create_folder(
        &self,
        parent: Option<NodeId>,
        name: &str,
        owner: UserId,
        at: Timestamp,
    ) -> NodeId {
        self.insert(parent, name, owner, at, NodeBody::Folder)
    }

    /// Create a notebook
    pub fn create_notebook(
        &self,
        parent: Option<NodeId>,
        name: &str,
        owner: UserId,
        at: Timestamp,
    ) -> NodeId {
        self.insert(parent, name, owner, at, NodeBody::Notebook)
    }

    /// Create a document with its first revision
    pub fn create_document(
        &self,
        parent: Option<NodeId>,
        name: &str,
        owner: UserId,
        fields: Vec<Field>,
        at: Timestamp,
    ) -> NodeId {
        let id = self.insert(
            parent,
            name,
            owner,
            at,
            NodeBody::Document {
                template: None,
                signature: None,
                fields: fields.clone(),
            },
        );
        self.inner.write().revisions.insert(
            id,
            vec![Revision {
                document: id,
                number: 1,
                modifier: owner,
                modified_at: at,
                fields,
            }],
        );
        id
    }

    /// Save new field values as the next revision
    pub fn add_revision(
        &self,
        document: NodeId,
        modifier: UserId,
        fields: Vec<Field>,
        at: Timestamp,
    ) -> RevisionNumber {
        let mut inner = self.inner.write();
        let revisions = inner.revisions.entry(document).or_default();
        let number = revisions.last().map(|r| r.number + 1).unwrap_or(1);
        revisions.push(Revision {
            document,
            number,
            modifier,
            modified_at: at,
            fields: fields.clone(),
        });
        let node = inner.node_mut(document);
        node.modified_at = at;
        if let NodeBody::Document { fields: current, .. } = &mut node.body {
            *current = fields;
        }
        number
    }

    /// Sign the current revision of a document
    pub fn sign(&self, document: NodeId, signer: UserId, at: Timestamp) -> RevisionNumber {
        let mut inner = self.inner.write();
        let revision = inner
            .revisions
            .get(&document)
            .and_then(|r| r.last())
            .map(|r| r.number)
            .unwrap_or(1);
        if let NodeBody::Document { signature, .. } = &mut inner.node_mut(document).body {
            *signature = Some(Signature {
                revision,
                signer,
                signed_at: at,
            });
        }
        revision
    }

    /// Record the template a document was created from
    pub fn set_template(&self, document: NodeId, template: NodeId) {
        let mut inner = self.inner.write();
        if let NodeBody::Document { template: t, .. } = &mut inner.node_mut(document).body {
            *t = Some(template);
        }
    }

    /// Upload a media file with its first binary
    #[allow(clippy::too_many_arguments)]
    pub fn create_media(
        &self,
        parent: Option<NodeId>,
        name: &str,
        owner: UserId,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
        at: Timestamp,
    ) -> NodeId {
        let id = self.insert(
            parent,
            name,
            owner,
            at,
            NodeBody::Media {
                file_name: file_name.to_string(),
                content_type: content_type.to_string(),
                versions: vec![MediaVersion {
                    version: 1,
                    created_at: at,
                    size: data.len() as u64,
                }],
            },
        );
        self.inner.write().binaries.insert((id, 1), data);
        id
    }

    /// Replace a media file's binary, creating the next version
    pub fn replace_media(&self, media: NodeId, data: Vec<u8>, at: Timestamp) -> MediaVersionNumber {
        let mut inner = self.inner.write();
        let size = data.len() as u64;
        let node = inner.node_mut(media);
        node.modified_at = at;
        let version = match &mut node.body {
            NodeBody::Media { versions, .. } => {
                let version = versions.last().map(|v| v.version + 1).unwrap_or(1);
                versions.push(MediaVersion {
                    version,
                    created_at: at,
                    size,
                });
                version
            }
            _ => panic!("node {} is not a media file", media),
        };
        inner.binaries.insert((media, version), data);
        version
    }

    /// Comment on a document
    pub fn add_comment(
        &self,
        document: NodeId,
        author: UserId,
        text: &str,
        at: Timestamp,
    ) -> NodeId {
        let owner = self.inner.read().nodes[&document].owner;
        self.insert(
            Some(document),
            "comment",
            owner,
            at,
            NodeBody::Comment {
                author,
                text: text.to_string(),
            },
        )
    }

    /// Attach an annotation to a document
    pub fn add_annotation(
        &self,
        document: NodeId,
        kind: AnnotationKind,
        data: &str,
        at: Timestamp,
    ) -> NodeId {
        let owner = self.inner.read().nodes[&document].owner;
        self.insert(
            Some(document),
            "annotation",
            owner,
            at,
            NodeBody::Annotation {
                kind,
                data: data.to_string(),
            },
        )
    }

    /// Mark a node deleted from `user`'s point of view
    pub fn delete_for(&self, node: NodeId, user: UserId) {
        self.inner.write().node_mut(node).deleted_for.insert(user);
    }

    /// Rename a node
    pub fn rename(&self, node: NodeId, name: &str) {
        self.inner.write().node_mut(node).name = name.to_string();
    }

    /// Make `commit_node` fail for nodes with this name
    pub fn reject_commits_named(&self, name: &str) {
        self.inner.write().rejected_names.insert(name.to_string());
    }

    /// Snapshot of a node
    pub fn node(&self, id: NodeId) -> Option<ContentNode> {
        self.inner.read().nodes.get(&id).cloned()
    }

    /// Every node with this name, ascending by id
    pub fn nodes_named(&self, name: &str) -> Vec<ContentNode> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| n.name == name)
            .cloned()
            .collect()
    }

    /// Number of stored nodes
    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Every stored node id
    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.inner.read().nodes.keys().copied().collect()
    }
}

impl ContentStore for MemoryContentStore {
    fn get(&self, id: NodeId) -> StoreResult<Option<ContentNode>> {
        Ok(self.inner.read().nodes.get(&id).cloned())
    }

    fn children_of(&self, parent: NodeId) -> StoreResult<Vec<NodeId>> {
        let inner = self.inner.read();
        let mut children: Vec<&ContentNode> = inner
            .nodes
            .values()
            .filter(|n| n.parent == Some(parent))
            .collect();
        children.sort_by_key(|n| (n.position, n.id));
        Ok(children.into_iter().map(|n| n.id).collect())
    }

    fn revisions_of(&self, document: NodeId) -> StoreResult<Vec<Revision>> {
        Ok(self
            .inner
            .read()
            .revisions
            .get(&document)
            .cloned()
            .unwrap_or_default())
    }

    fn media_binary(
        &self,
        media: NodeId,
        version: MediaVersionNumber,
    ) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.inner.read().binaries.get(&(media, version)).cloned())
    }

    fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.inner.read().users.get(&id).cloned())
    }

    fn user_by_name(&self, username: &str) -> StoreResult<Option<User>> {
        Ok(self
            .inner
            .read()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    fn group(&self, id: GroupId) -> StoreResult<Option<Group>> {
        Ok(self.inner.read().groups.get(&id).cloned())
    }

    fn group_by_name(&self, name: &str) -> StoreResult<Option<Group>> {
        Ok(self
            .inner
            .read()
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned())
    }

    fn home_folder(&self, user: UserId) -> StoreResult<Option<NodeId>> {
        Ok(self.inner.read().homes.get(&user).copied())
    }

    fn reserve_id(&self) -> StoreResult<NodeId> {
        let id = self.allocate();
        self.inner.write().reserved.insert(id);
        Ok(id)
    }

    fn commit_node(&self, commit: NodeCommit) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let id = commit.node.id;

        if !inner.reserved.contains(&id) {
            return Err(StoreError::Constraint(format!("node id {} was not reserved", id)));
        }
        if let Some(parent) = commit.node.parent {
            if !inner.nodes.contains_key(&parent) {
                return Err(StoreError::Constraint(format!(
                    "parent {} of node {} does not exist",
                    parent, id
                )));
            }
        }
        if inner.rejected_names.contains(&commit.node.name) {
            return Err(StoreError::Constraint(format!(
                "name '{}' is not allowed",
                commit.node.name
            )));
        }
        if !inner.users.contains_key(&commit.node.owner) {
            return Err(StoreError::Constraint(format!(
                "owner {} does not exist",
                commit.node.owner
            )));
        }

        inner.reserved.remove(&id);
        if !commit.revisions.is_empty() {
            let revisions = commit
                .revisions
                .into_iter()
                .map(|r| Revision { document: id, ..r })
                .collect();
            inner.revisions.insert(id, revisions);
        }
        for (version, data) in commit.binaries {
            inner.binaries.insert((id, version), data);
        }
        inner.nodes.insert(id, commit.node);
        Ok(())
    }

    fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let mut inner = self.inner.write();
        if inner.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Constraint(format!(
                "username '{}' is taken",
                user.username
            )));
        }
        inner.next_user += 1;
        let created = User {
            id: UserId(inner.next_user),
            username: user.username,
            display_name: user.display_name,
            email: user.email,
        };
        inner.users.insert(created.id, created.clone());
        Ok(created)
    }

    fn create_group(&self, name: &str, members: &[UserId], pis: &[UserId]) -> StoreResult<Group> {
        let mut inner = self.inner.write();
        if inner.groups.values().any(|g| g.name == name) {
            return Err(StoreError::Constraint(format!("group '{}' exists", name)));
        }
        inner.next_group += 1;
        let group = Group {
            id: GroupId(inner.next_group),
            name: name.to_string(),
            members: members.to_vec(),
            pis: pis.to_vec(),
        };
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }
}

/// Permission oracle that grants every read
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionOracle for AllowAll {
    fn can_read(&self, _identity: &Identity, _node: &ContentNode) -> bool {
        true
    }
}

/// Filestore kept in memory, keyed by `(filestore, path)`
#[derive(Default)]
pub struct MemoryFilestore {
    files: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    unavailable: RwLock<HashSet<(String, String)>>,
}

impl MemoryFilestore {
    /// Empty filestore
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a file; folders are implied by path prefixes
    pub fn add_file(&self, filestore: &str, path: &str, data: Vec<u8>) {
        self.files
            .write()
            .insert((filestore.to_string(), normalize(path)), data);
    }

    /// Make fetches of a path fail
    pub fn make_unavailable(&self, filestore: &str, path: &str) {
        self.unavailable
            .write()
            .insert((filestore.to_string(), normalize(path)));
    }

    fn unavailable(filestore: &str, path: &str, reason: &str) -> ArchiveError {
        ArchiveError::ExternalFileUnavailable {
            path: format!("{}:{}", filestore, path),
            reason: reason.to_string(),
        }
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

impl FilestoreClient for MemoryFilestore {
    fn stat(&self, filestore: &str, path: &str) -> Result<FilestoreEntry> {
        let path = normalize(path);
        let files = self.files.read();
        if let Some(data) = files.get(&(filestore.to_string(), path.clone())) {
            return Ok(FilestoreEntry {
                path,
                is_folder: false,
                size: data.len() as u64,
            });
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        if files
            .keys()
            .any(|(fs, p)| fs == filestore && p.starts_with(&prefix))
        {
            return Ok(FilestoreEntry {
                path,
                is_folder: true,
                size: 0,
            });
        }
        Err(Self::unavailable(filestore, &path, "no such file or folder"))
    }

    fn fetch_file(&self, filestore: &str, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        let key = (filestore.to_string(), path.clone());
        if self.unavailable.read().contains(&key) {
            return Err(Self::unavailable(filestore, &path, "connection refused"));
        }
        self.files
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::unavailable(filestore, &path, "no such file"))
    }

    fn list_folder(&self, filestore: &str, path: &str) -> Result<Vec<FilestoreEntry>> {
        let path = normalize(path);
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.files.read();
        let mut entries: BTreeMap<String, FilestoreEntry> = BTreeMap::new();
        for ((fs, p), data) in files.iter() {
            if fs != filestore {
                continue;
            }
            let Some(rest) = p.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((folder, _)) => {
                    let full = format!("{}{}", prefix, folder);
                    entries.entry(full.clone()).or_insert(FilestoreEntry {
                        path: full,
                        is_folder: true,
                        size: 0,
                    });
                }
                None => {
                    entries.insert(
                        p.clone(),
                        FilestoreEntry {
                            path: p.clone(),
                            is_folder: false,
                            size: data.len() as u64,
                        },
                    );
                }
            }
        }
        if entries.is_empty() {
            return Err(Self::unavailable(filestore, &path, "no such folder"));
        }
        Ok(entries.into_values().collect())
    }
}

/// Notification sink that records every outcome
#[derive(Default)]
pub struct RecordingSink {
    outcomes: Mutex<Vec<(UserId, JobOutcome)>>,
}

impl RecordingSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivered outcome, in order
    pub fn outcomes(&self) -> Vec<(UserId, JobOutcome)> {
        self.outcomes.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, user: UserId, outcome: &JobOutcome) {
        self.outcomes.lock().push((user, outcome.clone()));
    }
}
