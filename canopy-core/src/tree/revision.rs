//! Tree Revisions
//!
//! A [`TreeRevision`] is one immutable snapshot of a whole tree: a map from
//! [`Id`] to [`Node`].
//!
//! # Structural Sharing
//!
//! Nodes live behind `Arc` inside a fixed number of hash map shards, and each
//! shard is itself behind an `Arc`. Cloning a revision copies one vector of
//! shard pointers. Deriving a new revision through [`TreeRevision::with_updates`]
//! clones only the shards that contain a touched id, so a commit costs
//! roughly `touched nodes + shard size` instead of the size of the tree.
//!
//! Revisions are never mutated after they have been handed out. The only
//! mutating methods are crate private and used on fresh copies.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::id::Id;
use super::node::{Data, Node};
use crate::error::{SignalError, TreeError};
use crate::tree::command::NodeModification;

const SHARDS: usize = 32;

type Shard = HashMap<Id, Arc<Node>>;

/// An immutable snapshot of a tree.
#[derive(Clone)]
pub struct TreeRevision {
    shards: Arc<Vec<Arc<Shard>>>,
    len: usize,
}

impl TreeRevision {
    /// A revision holding only an empty root node.
    pub fn new() -> Self {
        let mut revision = Self::empty();
        revision.insert(Id::ZERO, Arc::new(Node::Data(Data::empty(Id::ZERO))));
        revision
    }

    /// Build a revision from a complete node map.
    ///
    /// The map is taken as is; call [`TreeRevision::validate`] to check it.
    pub fn from_nodes<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (Id, Node)>,
    {
        let mut revision = Self::empty();
        for (id, node) in nodes {
            revision.insert(id, Arc::new(node));
        }
        revision
    }

    fn empty() -> Self {
        Self {
            shards: Arc::new((0..SHARDS).map(|_| Arc::new(Shard::new())).collect()),
            len: 0,
        }
    }

    /// Number of nodes, aliases included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the revision holds no nodes at all.
    ///
    /// Only a decoded or hand built revision can be empty; trees always
    /// have a root.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw node stored under `id`, without alias resolution.
    pub fn node(&self, id: Id) -> Option<&Node> {
        self.shards[id.shard(SHARDS)].get(&id).map(|node| node.as_ref())
    }

    pub(crate) fn node_arc(&self, id: Id) -> Option<&Arc<Node>> {
        self.shards[id.shard(SHARDS)].get(&id)
    }

    /// Whether `id` is stored in this revision, as data or alias.
    pub fn contains(&self, id: Id) -> bool {
        self.node(id).is_some()
    }

    /// Follow one alias hop. Ids that are not aliases resolve to themselves.
    pub fn resolve_alias(&self, id: Id) -> Id {
        match self.node(id) {
            Some(Node::Alias { target }) => *target,
            _ => id,
        }
    }

    /// The data node addressed by `id`, resolving an alias if needed.
    pub fn data(&self, id: Id) -> Option<&Data> {
        self.node(self.resolve_alias(id)).and_then(Node::as_data)
    }

    /// Iterate all stored nodes. The order is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = (Id, &Node)> + '_ {
        self.shards
            .iter()
            .flat_map(|shard| shard.iter().map(|(id, node)| (*id, node.as_ref())))
    }

    /// Ids whose stored node differs between `self` and `other`.
    ///
    /// Shards shared between the two revisions are skipped without looking
    /// at their content.
    pub fn changed_ids(&self, other: &TreeRevision) -> Vec<Id> {
        let mut changed = Vec::new();
        for (mine, theirs) in self.shards.iter().zip(other.shards.iter()) {
            if Arc::ptr_eq(mine, theirs) {
                continue;
            }
            for (id, node) in mine.iter() {
                match theirs.get(id) {
                    Some(other) if Arc::ptr_eq(node, other) || node == other => {}
                    _ => changed.push(*id),
                }
            }
            for id in theirs.keys() {
                if !mine.contains_key(id) {
                    changed.push(*id);
                }
            }
        }
        changed.sort_unstable();
        changed
    }

    /// Derive a new revision with every modification applied.
    pub(crate) fn with_updates(&self, updates: &IndexMap<Id, NodeModification>) -> Self {
        let mut revision = self.clone();
        for (id, modification) in updates {
            match &modification.new {
                Some(node) => revision.insert(*id, Arc::clone(node)),
                None => revision.remove(*id),
            }
        }
        revision
    }

    fn insert(&mut self, id: Id, node: Arc<Node>) {
        let shards = Arc::make_mut(&mut self.shards);
        let shard = Arc::make_mut(&mut shards[id.shard(SHARDS)]);
        if shard.insert(id, node).is_none() {
            self.len += 1;
        }
    }

    fn remove(&mut self, id: Id) {
        if !self.contains(id) {
            return;
        }
        let shards = Arc::make_mut(&mut self.shards);
        let shard = Arc::make_mut(&mut shards[id.shard(SHARDS)]);
        if shard.remove(&id).is_some() {
            self.len -= 1;
        }
    }

    /// Check the structural invariants.
    ///
    /// - the root exists and has no parent
    /// - every other data node has a parent that lists it, and every listed
    ///   child points back to its parent
    /// - every data node is reachable from the root, which rules out
    ///   parent cycles
    /// - every alias points to a data node
    pub fn validate(&self) -> Result<(), TreeError> {
        let root = self.node(Id::ZERO).and_then(Node::as_data).ok_or(TreeError::MissingRoot)?;
        if root.parent().is_some() {
            return Err(TreeError::RootHasParent);
        }

        let mut data_nodes = 0;
        for (id, node) in self.iter() {
            let data = match node {
                Node::Alias { target } => {
                    if self.node(*target).and_then(Node::as_data).is_none() {
                        return Err(TreeError::DanglingAlias { alias: id, target: *target });
                    }
                    continue;
                }
                Node::Data(data) => data,
            };
            data_nodes += 1;

            if id != Id::ZERO {
                let parent = data.parent().ok_or(TreeError::Detached(id))?;
                let listed = self
                    .node(parent)
                    .and_then(Node::as_data)
                    .map_or(false, |parent_data| parent_data.has_child(id));
                if !listed {
                    return Err(TreeError::ParentMismatch { child: id, parent });
                }
            }

            for child in data.children() {
                let points_back = self
                    .node(child)
                    .and_then(Node::as_data)
                    .map_or(false, |child_data| child_data.parent() == Some(id));
                if !points_back {
                    return Err(TreeError::ChildMismatch { parent: id, child });
                }
            }
        }

        let mut reachable = 0;
        let mut stack = vec![Id::ZERO];
        while let Some(id) = stack.pop() {
            reachable += 1;
            if reachable > data_nodes {
                return Err(TreeError::Cycle(id));
            }
            if let Some(data) = self.node(id).and_then(Node::as_data) {
                stack.extend(data.children());
            }
        }
        if reachable != data_nodes {
            let unreachable = self
                .iter()
                .filter(|(_, node)| node.as_data().is_some())
                .map(|(id, _)| id)
                .find(|id| !self.is_reachable(*id))
                .unwrap_or(Id::ZERO);
            return Err(TreeError::Cycle(unreachable));
        }

        Ok(())
    }

    fn is_reachable(&self, mut id: Id) -> bool {
        for _ in 0..=self.len {
            if id == Id::ZERO {
                return true;
            }
            match self.node(id).and_then(Node::as_data).and_then(Data::parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
        false
    }

    /// Ordered copy of the node map, used for snapshots and encoding.
    pub fn to_nodes(&self) -> BTreeMap<Id, Node> {
        self.iter().map(|(id, node)| (id, node.clone())).collect()
    }

    /// Encode the whole revision as MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>, SignalError> {
        rmp_serde::to_vec_named(&self.to_nodes()).map_err(|e| SignalError::Snapshot(e.to_string()))
    }

    /// Decode a revision produced by [`TreeRevision::encode`] and validate it.
    pub fn decode(bytes: &[u8]) -> Result<Self, SignalError> {
        let nodes: BTreeMap<Id, Node> =
            rmp_serde::from_slice(bytes).map_err(|e| SignalError::Snapshot(e.to_string()))?;
        let revision = Self::from_nodes(nodes);
        revision
            .validate()
            .map_err(|e| SignalError::Snapshot(e.to_string()))?;
        Ok(revision)
    }
}

impl Default for TreeRevision {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TreeRevision {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.shards, &other.shards) {
            return true;
        }
        self.len == other.len && self.changed_ids(other).is_empty()
    }
}

impl Eq for TreeRevision {}

impl fmt::Debug for TreeRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.to_nodes()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn child_of(parent: Id, update: Id) -> Node {
        Node::Data(Data::empty(update).with_parent(Some(parent)))
    }

    fn two_level() -> (TreeRevision, Id) {
        let child = Id::random();
        let root = Data::empty(Id::ZERO).with_list_children(vec![child], child);
        let revision = TreeRevision::from_nodes([
            (Id::ZERO, Node::Data(root)),
            (child, child_of(Id::ZERO, child)),
        ]);
        (revision, child)
    }

    #[test]
    fn new_revision_has_valid_root() {
        let revision = TreeRevision::new();

        assert_eq!(revision.len(), 1);
        assert!(revision.data(Id::ZERO).is_some());
        assert!(revision.validate().is_ok());
    }

    #[test]
    fn updates_share_untouched_shards() {
        let (revision, child) = two_level();
        let mut updates = IndexMap::new();
        let changed = Data::empty(child)
            .with_parent(Some(Id::ZERO))
            .with_value(Some(json!("x")), child);
        updates.insert(
            child,
            NodeModification {
                old: revision.node_arc(child).cloned(),
                new: Some(Arc::new(Node::Data(changed))),
            },
        );

        let next = revision.with_updates(&updates);

        assert_eq!(next.changed_ids(&revision), vec![child]);
        assert_eq!(revision.data(child).and_then(Data::value), None);
        assert_eq!(next.data(child).and_then(Data::value), Some(&json!("x")));

        let shared = revision
            .shards
            .iter()
            .zip(next.shards.iter())
            .filter(|(a, b)| Arc::ptr_eq(a, b))
            .count();
        assert_eq!(shared, SHARDS - 1);
    }

    #[test]
    fn aliases_resolve_one_hop() {
        let (revision, child) = two_level();
        let alias = Id::random();
        let revision = revision.with_updates(&IndexMap::from([(
            alias,
            NodeModification { old: None, new: Some(Arc::new(Node::Alias { target: child })) },
        )]));

        assert_eq!(revision.resolve_alias(alias), child);
        assert_eq!(revision.data(alias), revision.data(child));
        assert!(revision.validate().is_ok());
    }

    #[test]
    fn validate_reports_broken_links() {
        let orphan = Id::random();
        let revision = TreeRevision::from_nodes([
            (Id::ZERO, Node::Data(Data::empty(Id::ZERO))),
            (orphan, child_of(Id::ZERO, orphan)),
        ]);
        assert_eq!(
            revision.validate(),
            Err(TreeError::ParentMismatch { child: orphan, parent: Id::ZERO })
        );

        let missing = TreeRevision::from_nodes([(orphan, child_of(Id::ZERO, orphan))]);
        assert_eq!(missing.validate(), Err(TreeError::MissingRoot));

        let dangling = TreeRevision::from_nodes([
            (Id::ZERO, Node::Data(Data::empty(Id::ZERO))),
            (orphan, Node::Alias { target: Id::random() }),
        ]);
        assert!(matches!(dangling.validate(), Err(TreeError::DanglingAlias { .. })));
    }

    #[test]
    fn validate_detects_cycles() {
        let a = Id::random();
        let b = Id::random();
        let revision = TreeRevision::from_nodes([
            (Id::ZERO, Node::Data(Data::empty(Id::ZERO))),
            (a, Node::Data(Data::empty(a).with_parent(Some(b)).with_list_children(vec![b], a))),
            (b, Node::Data(Data::empty(b).with_parent(Some(a)).with_list_children(vec![a], b))),
        ]);

        assert!(matches!(revision.validate(), Err(TreeError::Cycle(_))));
    }

    #[test]
    fn encode_and_decode_restore_the_same_revision() {
        let (revision, _) = two_level();

        let bytes = revision.encode().unwrap();
        let decoded = TreeRevision::decode(&bytes).unwrap();

        assert_eq!(decoded, revision);
        assert!(TreeRevision::decode(b"not msgpack").is_err());
    }
}
