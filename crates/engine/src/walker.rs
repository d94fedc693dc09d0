//! Reference graph walker
//!
//! Breadth-first traversal from the root set along hyperlinks, template
//! provenance and attachments. Link graphs are cyclic in practice (two
//! documents linking each other), so the walk is an explicit level-by-level
//! worklist with a seen set keyed by node id; it never recurses.
//!
//! ## Depth policy
//!
//! Roots sit at depth 0. Hyperlinks and template provenance from a node at
//! depth `d` are followed only while `d < max_link_level`; followed targets
//! enter at `d + 1`. Attachments of media files are followed at any depth
//! and stay at the depth of the document embedding them; an attachment
//! token naming any other kind counts as a hyperlink. Comments and
//! annotations always travel with their document. Every node of depth `d`
//! is processed before any node of depth `d + 1`.
//!
//! Once the walk ends, each recorded link is marked `Follow` when its
//! target is in the closed set and `External` otherwise, so two documents
//! exported together always link to each other inside the archive.

use crate::job::CancellationToken;
use crate::scope::{is_visible, Inclusion, ScopeRoots};
use crate::snapshot::SnapshotReader;
use crate::versions;
use folio_core::markup::{self, Token};
use folio_core::{
    ContentNode, Identity, Link, LinkKind, LinkPolicy, NodeId, NodeKind, PermissionOracle, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Why a node is in the closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reached {
    /// Part of the resolved scope
    Root(Inclusion),
    /// Comment or annotation of an included document
    Child,
    /// Target of a followed hyperlink
    Hyperlink,
    /// Embedded media of an included document
    Attachment,
    /// Template an included document was created from
    Template,
}

/// A node admitted by the walk
#[derive(Debug, Clone)]
pub struct WalkedNode {
    /// The node as read at admission
    pub node: Arc<ContentNode>,
    /// Link hops from the root set
    pub depth: u32,
    /// How it was reached
    pub reached: Reached,
}

/// Reference to a path on an external filestore
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NfsReference {
    /// Document holding the reference
    pub source: NodeId,
    /// Filestore name
    pub filestore: String,
    /// Path inside the filestore
    pub path: String,
}

/// Result of a walk: every node to export, with the links between them
#[derive(Debug, Clone, Default)]
pub struct ClosedSet {
    nodes: Vec<WalkedNode>,
    index: HashMap<NodeId, usize>,
    links: Vec<Link>,
    nfs: Vec<NfsReference>,
}

impl ClosedSet {
    fn admit(&mut self, node: Arc<ContentNode>, depth: u32, reached: Reached) -> bool {
        if self.index.contains_key(&node.id) {
            return false;
        }
        self.index.insert(node.id, self.nodes.len());
        self.nodes.push(WalkedNode {
            node,
            depth,
            reached,
        });
        true
    }

    /// Nodes in admission order
    pub fn nodes(&self) -> &[WalkedNode] {
        &self.nodes
    }

    /// Node by id
    pub fn get(&self, id: NodeId) -> Option<&WalkedNode> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    /// Whether a node was admitted
    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    /// Depth at which a node was admitted
    pub fn depth_of(&self, id: NodeId) -> Option<u32> {
        self.get(id).map(|w| w.depth)
    }

    /// Every distinct link found, with its final policy
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Policy for a link to `target`
    pub fn policy_for(&self, target: NodeId) -> LinkPolicy {
        if self.contains(target) {
            LinkPolicy::Follow
        } else {
            LinkPolicy::External
        }
    }

    /// External filestore references, in discovery order
    pub fn nfs(&self) -> &[NfsReference] {
        &self.nfs
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing was admitted
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Traversal parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOptions {
    /// Hyperlink hops to follow from the root set
    pub max_link_level: u32,
    /// Read links from every revision, not just the effective one
    pub include_all_versions: bool,
}

#[derive(Default)]
struct References {
    links: Vec<(NodeId, LinkKind)>,
    nfs: Vec<(String, String)>,
}

/// Computes the closed set of an export
pub struct GraphWalker<'a> {
    snapshot: &'a SnapshotReader,
    oracle: &'a dyn PermissionOracle,
    identity: &'a Identity,
    options: WalkOptions,
    cancel: &'a CancellationToken,
}

impl<'a> GraphWalker<'a> {
    /// Walker for one job
    pub fn new(
        snapshot: &'a SnapshotReader,
        oracle: &'a dyn PermissionOracle,
        identity: &'a Identity,
        options: WalkOptions,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            snapshot,
            oracle,
            identity,
            options,
            cancel,
        }
    }

    /// Walk from the root set
    pub fn walk(&self, roots: &ScopeRoots) -> Result<ClosedSet> {
        let mut closed = ClosedSet::default();
        let mut raw_links: Vec<(NodeId, NodeId, LinkKind)> = Vec::new();
        let mut seen_links: HashSet<(NodeId, NodeId, LinkKind)> = HashSet::new();
        let mut seen_nfs: HashSet<NfsReference> = HashSet::new();

        let mut frontier: Vec<NodeId> = Vec::new();
        for root in &roots.roots {
            if let Some(node) = self.snapshot.node(root.node)? {
                if closed.admit(node, 0, Reached::Root(root.inclusion)) {
                    frontier.push(root.node);
                }
            }
        }

        let mut depth = 0u32;
        while !frontier.is_empty() {
            // Next level is admitted only once this one is done, keeping
            // admission order sorted by depth
            let mut next: Vec<(Arc<ContentNode>, Reached)> = Vec::new();
            let mut queued: HashSet<NodeId> = HashSet::new();
            // Children and attachments join the current level while it is processed
            let mut i = 0;
            while i < frontier.len() {
                self.cancel.check()?;
                let id = frontier[i];
                i += 1;
                let Some(node) = closed.get(id).map(|w| Arc::clone(&w.node)) else {
                    continue;
                };

                if node.kind() == NodeKind::Document {
                    for child in self.snapshot.children(id)?.iter() {
                        if closed.contains(*child) {
                            continue;
                        }
                        if let Some(c) = self.visible(*child)? {
                            closed.admit(c, depth, Reached::Child);
                            frontier.push(*child);
                        }
                    }
                }

                let refs = self.references(&node)?;
                for (filestore, path) in refs.nfs {
                    let reference = NfsReference {
                        source: id,
                        filestore,
                        path,
                    };
                    if seen_nfs.insert(reference.clone()) {
                        closed.nfs.push(reference);
                    }
                }

                for (target, kind) in refs.links {
                    if seen_links.insert((id, target, kind)) {
                        raw_links.push((id, target, kind));
                    }
                    if closed.contains(target) {
                        continue;
                    }
                    let within_budget =
                        depth < self.options.max_link_level && !queued.contains(&target);
                    if kind != LinkKind::Attachment && !within_budget {
                        continue;
                    }
                    let Some(target_node) = self.visible(target)? else {
                        debug!(
                            target: "folio::walker",
                            source = %id,
                            target = %target,
                            "Link target not visible, leaving external"
                        );
                        continue;
                    };
                    match kind {
                        LinkKind::Attachment if target_node.kind() == NodeKind::MediaFile => {
                            closed.admit(target_node, depth, Reached::Attachment);
                            frontier.push(target);
                        }
                        // An attachment token naming anything but a media file is a hyperlink
                        LinkKind::Attachment | LinkKind::Hyperlink => {
                            if !within_budget {
                                continue;
                            }
                            queued.insert(target);
                            next.push((target_node, Reached::Hyperlink));
                        }
                        LinkKind::TemplateProvenance => {
                            queued.insert(target);
                            next.push((target_node, Reached::Template));
                        }
                    }
                }
            }
            depth += 1;
            frontier = Vec::with_capacity(next.len());
            for (node, reached) in next {
                let id = node.id;
                if closed.admit(node, depth, reached) {
                    frontier.push(id);
                }
            }
        }

        closed.links = raw_links
            .into_iter()
            .map(|(source, target, kind)| Link {
                source,
                target,
                kind,
                policy: closed.policy_for(target),
            })
            .collect();

        debug!(
            target: "folio::walker",
            nodes = closed.len(),
            links = closed.links.len(),
            nfs = closed.nfs.len(),
            levels = depth,
            "Walk complete"
        );
        Ok(closed)
    }

    fn visible(&self, id: NodeId) -> Result<Option<Arc<ContentNode>>> {
        Ok(self
            .snapshot
            .node(id)?
            .filter(|n| is_visible(self.oracle, self.identity, n)))
    }

    /// Outgoing references of a node, in order of appearance
    fn references(&self, node: &ContentNode) -> Result<References> {
        let mut refs = References::default();
        if node.kind() != NodeKind::Document {
            return Ok(refs);
        }
        if let Some(template) = node.template() {
            refs.links.push((template, LinkKind::TemplateProvenance));
        }

        let stored = self.snapshot.revisions(node.id)?;
        let revisions =
            versions::selected_revisions(node, &stored, self.options.include_all_versions);
        for revision in &revisions {
            for field in &revision.fields {
                for token in markup::tokens(&field.content) {
                    match token {
                        Token::Link(target) => refs.links.push((target, LinkKind::Hyperlink)),
                        Token::Attachment { media, .. } => {
                            refs.links.push((media, LinkKind::Attachment))
                        }
                        Token::Nfs { filestore, path } => refs.nfs.push((filestore, path)),
                        Token::Url(_) | Token::Ref(_) | Token::Media { .. } => {}
                    }
                }
            }
        }
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllowAll, MemoryContentStore};
    use crate::scope::{ExportScope, ScopeResolver};
    use folio_core::{Field, UserId};
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn walk(
        store: &Arc<MemoryContentStore>,
        identity: &Identity,
        scope: ExportScope,
        max_link_level: u32,
        include_all_versions: bool,
    ) -> ClosedSet {
        let snapshot = SnapshotReader::new(store.clone());
        let roots = ScopeResolver::new(&snapshot, &AllowAll, identity)
            .resolve(&scope)
            .unwrap();
        let cancel = CancellationToken::new();
        GraphWalker::new(
            &snapshot,
            &AllowAll,
            identity,
            WalkOptions {
                max_link_level,
                include_all_versions,
            },
            &cancel,
        )
        .walk(&roots)
        .unwrap()
    }

    fn data(content: String) -> Vec<Field> {
        vec![Field::new("data", content)]
    }

    #[test]
    fn cycle_terminates() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let a = store.create_document(None, "A", u, vec![], 1);
        let b = store.create_document(None, "B", u, vec![], 1);
        store.add_revision(a, u, data(format!("{{{{link:{}}}}}", b)), 2);
        store.add_revision(b, u, data(format!("{{{{link:{}}}}}", a)), 2);

        let closed = walk(&store, &store.identity(u), ExportScope::Record(a), 10, false);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed.depth_of(b), Some(1));
        assert!(closed.links().iter().all(|l| l.policy == LinkPolicy::Follow));
    }

    #[test]
    fn depth_zero_leaves_links_external() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let b = store.create_document(None, "B", u, vec![], 1);
        let a = store.create_document(None, "A", u, data(format!("{{{{link:{}}}}}", b)), 1);

        let closed = walk(&store, &store.identity(u), ExportScope::Record(a), 0, false);
        assert!(!closed.contains(b));
        assert_eq!(closed.links()[0].policy, LinkPolicy::External);

        let together = walk(
            &store,
            &store.identity(u),
            ExportScope::Selection(vec![a, b]),
            0,
            false,
        );
        assert_eq!(together.links()[0].policy, LinkPolicy::Follow);
    }

    #[test]
    fn attachments_ignore_depth() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let m = store.create_media(None, "gel", u, "gel.png", "image/png", vec![1, 2, 3], 1);
        let a = store.create_document(None, "A", u, data(format!("{{{{attachment:{}}}}}", m)), 2);

        let closed = walk(&store, &store.identity(u), ExportScope::Record(a), 0, false);
        assert!(closed.contains(m));
        assert_eq!(closed.depth_of(m), Some(0));
        assert_eq!(closed.get(m).unwrap().reached, Reached::Attachment);
    }

    #[test]
    fn attachment_to_a_document_follows_the_depth_budget() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let c = store.create_document(None, "C", u, vec![], 1);
        let b = store.create_document(None, "B", u, data(format!("{{{{link:{}}}}}", c)), 1);
        let a = store.create_document(None, "A", u, data(format!("{{{{attachment:{}}}}}", b)), 2);

        let shallow = walk(&store, &store.identity(u), ExportScope::Record(a), 0, false);
        assert!(!shallow.contains(b));

        let one = walk(&store, &store.identity(u), ExportScope::Record(a), 1, false);
        assert_eq!(one.depth_of(b), Some(1));
        assert_eq!(one.get(b).unwrap().reached, Reached::Hyperlink);
        assert!(!one.contains(c));
    }

    #[test]
    fn comments_travel_with_linked_documents() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let b = store.create_document(None, "B", u, vec![], 1);
        let c = store.add_comment(b, u, "check this", 2);
        let a = store.create_document(None, "A", u, data(format!("{{{{link:{}}}}}", b)), 3);

        let closed = walk(&store, &store.identity(u), ExportScope::Record(a), 1, false);
        assert_eq!(closed.get(c).unwrap().reached, Reached::Child);
        assert_eq!(closed.depth_of(c), Some(1));
    }

    #[test]
    fn links_in_old_revisions_need_all_versions() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let b = store.create_document(None, "B", u, vec![], 1);
        let a = store.create_document(None, "A", u, data(format!("{{{{link:{}}}}}", b)), 2);
        store.add_revision(a, u, data("link removed".into()), 3);

        let effective = walk(&store, &store.identity(u), ExportScope::Record(a), 1, false);
        assert!(!effective.contains(b));
        let all = walk(&store, &store.identity(u), ExportScope::Record(a), 1, true);
        assert!(all.contains(b));
    }

    #[test]
    fn template_provenance_is_a_link() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let t = store.create_document(None, "Template", u, vec![], 1);
        let a = store.create_document(None, "A", u, vec![], 2);
        store.set_template(a, t);

        let closed = walk(&store, &store.identity(u), ExportScope::Record(a), 1, false);
        assert_eq!(closed.get(t).unwrap().reached, Reached::Template);
        assert_eq!(closed.links()[0].kind, LinkKind::TemplateProvenance);
    }

    #[test]
    fn nfs_references_are_collected_once() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let a = store.create_document(
            None,
            "A",
            u,
            data("{{nfs:lab:/runs/a.csv}} and again {{nfs:lab:/runs/a.csv}}".into()),
            1,
        );
        let closed = walk(&store, &store.identity(u), ExportScope::Record(a), 0, false);
        assert_eq!(closed.nfs().len(), 1);
        assert_eq!(closed.nfs()[0].path, "/runs/a.csv");
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let store = Arc::new(MemoryContentStore::new());
        let u = store.add_user("alice");
        let a = store.create_document(None, "A", u, vec![], 1);
        let identity = store.identity(u);
        let snapshot = SnapshotReader::new(store.clone());
        let roots = ScopeResolver::new(&snapshot, &AllowAll, &identity)
            .resolve(&ExportScope::Record(a))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let walker = GraphWalker::new(
            &snapshot,
            &AllowAll,
            &identity,
            WalkOptions {
                max_link_level: 1,
                include_all_versions: false,
            },
            &cancel,
        );
        assert!(matches!(
            walker.walk(&roots),
            Err(folio_core::ArchiveError::Cancelled)
        ));
    }

    /// Shortest hop count from node 0 along hyperlinks, independent of the walker
    fn bfs_distances(n: usize, edges: &[(usize, usize)]) -> Vec<Option<u32>> {
        let mut dist = vec![None; n];
        dist[0] = Some(0);
        let mut queue = VecDeque::from([0usize]);
        while let Some(v) = queue.pop_front() {
            for &(s, t) in edges {
                if s == v && dist[t].is_none() {
                    dist[t] = dist[v].map(|d| d + 1);
                    queue.push_back(t);
                }
            }
        }
        dist
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn walk_invariants_on_random_graphs(
            n in 1usize..10,
            raw_edges in prop::collection::vec((0usize..10, 0usize..10), 0..30),
            max_level in 0u32..4,
        ) {
            let edges: Vec<(usize, usize)> = raw_edges
                .into_iter()
                .map(|(s, t)| (s % n, t % n))
                .collect();

            let store = Arc::new(MemoryContentStore::new());
            let u: UserId = store.add_user("alice");
            let ids: Vec<NodeId> = (0..n)
                .map(|i| store.create_document(None, &format!("d{}", i), u, vec![], 1))
                .collect();
            for (i, id) in ids.iter().enumerate() {
                let content: String = edges
                    .iter()
                    .filter(|(s, _)| *s == i)
                    .map(|(_, t)| format!("{{{{link:{}}}}} ", ids[*t]))
                    .collect();
                store.add_revision(*id, u, data(content), 2);
            }

            let scope = ExportScope::Record(ids[0]);
            let closed = walk(&store, &store.identity(u), scope, max_level, false);

            // No node twice
            let unique: HashSet<NodeId> = closed.nodes().iter().map(|w| w.node.id).collect();
            prop_assert_eq!(unique.len(), closed.len());

            // Depth is the shortest path, capped by the level
            let dist = bfs_distances(n, &edges);
            for (i, id) in ids.iter().enumerate() {
                match dist[i] {
                    Some(d) if d <= max_level => prop_assert_eq!(closed.depth_of(*id), Some(d)),
                    _ => prop_assert!(!closed.contains(*id)),
                }
            }

            // Follow exactly when the target is inside
            for link in closed.links() {
                prop_assert!(closed.contains(link.source));
                prop_assert_eq!(link.policy == LinkPolicy::Follow, closed.contains(link.target));
            }

            // Nodes appear in non-decreasing depth
            let depths: Vec<u32> = closed.nodes().iter().map(|w| w.depth).collect();
            prop_assert!(depths.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
