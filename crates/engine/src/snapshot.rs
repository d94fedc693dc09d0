//! Per-job read cache over the content store
//!
//! Every node, child list and revision list read during one job is
//! memoized, so the scope resolver, walker, version selector and packager
//! all observe the same value for an entity. Edits committed by owners
//! after the first read are not seen by the job.

use dashmap::DashMap;
use folio_core::{
    ContentNode, ContentStore, Group, GroupId, MediaVersionNumber, NodeId, Result, Revision, User,
    UserId,
};
use std::sync::Arc;

/// Memoizing reader shared by all stages of one job
pub struct SnapshotReader {
    store: Arc<dyn ContentStore>,
    nodes: DashMap<NodeId, Option<Arc<ContentNode>>>,
    children: DashMap<NodeId, Arc<Vec<NodeId>>>,
    revisions: DashMap<NodeId, Arc<Vec<Revision>>>,
    users: DashMap<UserId, Option<User>>,
}

impl SnapshotReader {
    /// Start an empty snapshot over `store`
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            nodes: DashMap::new(),
            children: DashMap::new(),
            revisions: DashMap::new(),
            users: DashMap::new(),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Node by id, `None` if it does not exist
    pub fn node(&self, id: NodeId) -> Result<Option<Arc<ContentNode>>> {
        if let Some(cached) = self.nodes.get(&id) {
            return Ok(cached.value().clone());
        }
        let fetched = self.store.get(id)?.map(Arc::new);
        // First read wins if two threads raced
        Ok(self.nodes.entry(id).or_insert(fetched).value().clone())
    }

    /// Children ordered by position
    pub fn children(&self, id: NodeId) -> Result<Arc<Vec<NodeId>>> {
        if let Some(cached) = self.children.get(&id) {
            return Ok(Arc::clone(cached.value()));
        }
        let fetched = Arc::new(self.store.children_of(id)?);
        Ok(Arc::clone(self.children.entry(id).or_insert(fetched).value()))
    }

    /// Revisions ascending by number
    pub fn revisions(&self, document: NodeId) -> Result<Arc<Vec<Revision>>> {
        if let Some(cached) = self.revisions.get(&document) {
            return Ok(Arc::clone(cached.value()));
        }
        let mut fetched = self.store.revisions_of(document)?;
        fetched.sort_by_key(|r| r.number);
        let fetched = Arc::new(fetched);
        Ok(Arc::clone(self.revisions.entry(document).or_insert(fetched).value()))
    }

    /// User by id
    pub fn user(&self, id: UserId) -> Result<Option<User>> {
        if let Some(cached) = self.users.get(&id) {
            return Ok(cached.value().clone());
        }
        let fetched = self.store.user(id)?;
        Ok(self.users.entry(id).or_insert(fetched).value().clone())
    }

    /// Username of a user, falling back to its numeric id
    pub fn username(&self, id: UserId) -> Result<String> {
        Ok(self
            .user(id)?
            .map(|u| u.username)
            .unwrap_or_else(|| format!("user-{}", id)))
    }

    /// Group by id (not memoized, read once per job)
    pub fn group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.store.group(id)?)
    }

    /// Home folder of a user
    pub fn home_folder(&self, user: UserId) -> Result<Option<NodeId>> {
        Ok(self.store.home_folder(user)?)
    }

    /// Binary of a media version
    ///
    /// Binaries are immutable per version and not cached.
    pub fn media_binary(
        &self,
        media: NodeId,
        version: MediaVersionNumber,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.store.media_binary(media, version)?)
    }
}
