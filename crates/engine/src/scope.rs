//! Export scope resolution
//!
//! Turns an export request (one record, a selection, a folder, a user's
//! work or a whole group's work) into the ordered root set handed to the
//! graph walker.
//!
//! Explicitly named nodes are authorization-checked and fail the request
//! when unreadable. Content found by expanding containers is filtered
//! quietly: unreadable or deleted nodes are dropped with their subtree.
//! Deletion is asymmetric. A node deleted by its owner is gone for
//! everyone, while a sharee deleting their view of a shared node does not
//! hide it from the owner.

use crate::snapshot::SnapshotReader;
use folio_core::{
    ArchiveError, ContentNode, GroupId, Identity, NodeId, NodeKind, PermissionOracle, Result,
    UserId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What the requester asked to export
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportScope {
    /// One document or media file, or one container with its content
    Record(NodeId),
    /// Several explicitly selected nodes
    Selection(Vec<NodeId>),
    /// A folder or notebook with everything below it
    Folder(NodeId),
    /// Everything in a user's home folder
    User(UserId),
    /// Every member's home folder
    Group(GroupId),
}

/// How a node entered the root set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Inclusion {
    /// Named explicitly by the request
    Forced,
    /// Found by expanding a container or document
    Discovered,
}

/// One node of the root set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRoot {
    /// Node id
    pub node: NodeId,
    /// How it was included
    pub inclusion: Inclusion,
}

/// Ordered, duplicate-free root set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeRoots {
    /// Roots in selection order, containers expanded depth-first
    pub roots: Vec<ScopeRoot>,
    /// Group whose work is exported, for the manifest
    pub group: Option<folio_core::Group>,
    index: HashMap<NodeId, usize>,
}

impl ScopeRoots {
    fn push(&mut self, node: NodeId, inclusion: Inclusion) {
        match self.index.get(&node) {
            Some(&i) => {
                if inclusion == Inclusion::Forced {
                    self.roots[i].inclusion = Inclusion::Forced;
                }
            }
            None => {
                self.index.insert(node, self.roots.len());
                self.roots.push(ScopeRoot { node, inclusion });
            }
        }
    }

    /// Whether a node is in the root set
    pub fn contains(&self, node: NodeId) -> bool {
        self.index.contains_key(&node)
    }

    /// Root ids in order
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.roots.iter().map(|r| r.node)
    }

    /// Number of roots
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether the root set is empty
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Whether `identity` may see a node found during expansion or traversal
pub(crate) fn is_visible(
    oracle: &dyn PermissionOracle,
    identity: &Identity,
    node: &ContentNode,
) -> bool {
    !node.is_deleted_for(identity.user) && oracle.can_read(identity, node)
}

/// Resolves an [`ExportScope`] into [`ScopeRoots`]
pub struct ScopeResolver<'a> {
    snapshot: &'a SnapshotReader,
    oracle: &'a dyn PermissionOracle,
    identity: &'a Identity,
}

impl<'a> ScopeResolver<'a> {
    /// Resolver for one job
    pub fn new(
        snapshot: &'a SnapshotReader,
        oracle: &'a dyn PermissionOracle,
        identity: &'a Identity,
    ) -> Self {
        Self {
            snapshot,
            oracle,
            identity,
        }
    }

    /// Resolve a scope
    pub fn resolve(&self, scope: &ExportScope) -> Result<ScopeRoots> {
        let mut roots = ScopeRoots::default();
        match scope {
            ExportScope::Record(id) => {
                self.add_forced(&mut roots, *id)?;
            }
            ExportScope::Selection(ids) => {
                if ids.is_empty() {
                    return Err(ArchiveError::invalid_config("selection is empty"));
                }
                for id in ids {
                    self.add_forced(&mut roots, *id)?;
                }
            }
            ExportScope::Folder(id) => {
                let node = self.forced_node(*id)?;
                if !node.kind().is_container() {
                    return Err(ArchiveError::invalid_config(format!(
                        "node {} is a {}, not a folder or notebook",
                        id,
                        node.kind()
                    )));
                }
                self.add_forced(&mut roots, *id)?;
            }
            ExportScope::User(user) => {
                if *user != self.identity.user && !self.identity.admin {
                    return Err(ArchiveError::AuthorizationDenied(format!(
                        "{} may not export the work of user {}",
                        self.identity.username, user
                    )));
                }
                self.add_home_folder(&mut roots, *user)?;
            }
            ExportScope::Group(group_id) => {
                let group = self
                    .snapshot
                    .group(*group_id)?
                    .ok_or_else(|| ArchiveError::NotFound(format!("group {}", group_id)))?;
                if !group.is_pi(self.identity.user) && !self.identity.admin {
                    return Err(ArchiveError::AuthorizationDenied(format!(
                        "{} is not a PI of group '{}'",
                        self.identity.username, group.name
                    )));
                }
                for member in &group.members {
                    self.expand_discovered(&mut roots, *member)?;
                }
                roots.group = Some(group);
            }
        }

        debug!(
            target: "folio::export",
            requester = %self.identity.username,
            roots = roots.len(),
            "Scope resolved"
        );
        Ok(roots)
    }

    fn forced_node(&self, id: NodeId) -> Result<Arc<ContentNode>> {
        let node = self
            .snapshot
            .node(id)?
            .ok_or_else(|| ArchiveError::node_not_found(id))?;
        if node.is_deleted_for(self.identity.user) {
            return Err(ArchiveError::NotFound(format!("node {} is deleted", id)));
        }
        if !self.oracle.can_read(self.identity, &node) {
            return Err(ArchiveError::denied(id));
        }
        Ok(node)
    }

    fn add_forced(&self, roots: &mut ScopeRoots, id: NodeId) -> Result<()> {
        let node = self.forced_node(id)?;
        roots.push(id, Inclusion::Forced);
        self.expand(roots, &node)
    }

    fn add_home_folder(&self, roots: &mut ScopeRoots, user: UserId) -> Result<()> {
        let home = self
            .snapshot
            .home_folder(user)?
            .ok_or_else(|| ArchiveError::NotFound(format!("home folder of user {}", user)))?;
        self.add_forced(roots, home)
    }

    /// A group member's home folder is visited like any other discovered content
    fn expand_discovered(&self, roots: &mut ScopeRoots, user: UserId) -> Result<()> {
        let Some(home) = self.snapshot.home_folder(user)? else {
            return Ok(());
        };
        let Some(node) = self.snapshot.node(home)? else {
            return Ok(());
        };
        if !is_visible(self.oracle, self.identity, &node) {
            debug!(target: "folio::export", user = %user, "Home folder not visible, skipping");
            return Ok(());
        }
        roots.push(home, Inclusion::Discovered);
        self.expand(roots, &node)
    }

    /// Depth-first pre-order expansion below `node`, with an explicit stack
    fn expand(&self, roots: &mut ScopeRoots, node: &ContentNode) -> Result<()> {
        let expandable = |kind: NodeKind| kind.is_container() || kind == NodeKind::Document;
        if !expandable(node.kind()) {
            return Ok(());
        }

        let mut stack: Vec<NodeId> = self
            .snapshot
            .children(node.id)?
            .iter()
            .rev()
            .copied()
            .collect();
        while let Some(id) = stack.pop() {
            let Some(child) = self.snapshot.node(id)? else {
                continue;
            };
            if !is_visible(self.oracle, self.identity, &child) {
                debug!(
                    target: "folio::export",
                    node = %id,
                    "Skipping hidden descendant and its subtree"
                );
                continue;
            }
            if roots.contains(id) {
                continue;
            }
            roots.push(id, Inclusion::Discovered);
            if expandable(child.kind()) {
                stack.extend(self.snapshot.children(id)?.iter().rev().copied());
            }
        }
        Ok(())
    }
}
