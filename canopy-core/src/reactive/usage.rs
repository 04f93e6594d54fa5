//! Recorded dependencies.
//!
//! A [`Usage`] remembers what a computation saw and can tell whether that
//! has changed since. [`NodeUsage`] is the one kind the tree produces: a
//! fingerprint of one aspect of one node.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use super::Subscription;
use crate::tree::{Id, SignalTree, TreeRevision};

/// Called when a usage may have changed. Returns `true` to keep listening.
pub type ChangeListener = Arc<dyn Fn() -> bool + Send + Sync>;

pub trait Usage: Send + Sync {
    /// Whether the current state differs from what was recorded.
    fn has_changes(&self) -> bool;

    /// Call `listener` on the next change.
    ///
    /// If there already is a change, `listener` is called right away and
    /// the subscription only stays registered if it returns `true`.
    fn on_next_change(&self, listener: ChangeListener) -> Subscription;

    /// Whether writing node `id` of tree `tree` could change this usage.
    fn covers(&self, tree: u64, id: Id) -> bool;
}

/// The part of a node a read depended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aspect {
    Value,
    ListChildren,
    MapChildren,
    /// Any change to the node.
    LastUpdate,
}

#[derive(Debug, Clone, PartialEq)]
enum Fingerprint {
    Missing,
    Value(Option<Value>),
    ListChildren(Vec<Id>),
    MapChildren(IndexMap<String, Id>),
    LastUpdate(Id),
}

impl Fingerprint {
    fn capture(revision: &TreeRevision, id: Id, aspect: Aspect) -> Self {
        let Some(data) = revision.data(id) else {
            return Fingerprint::Missing;
        };
        match aspect {
            Aspect::Value => Fingerprint::Value(data.value().cloned()),
            Aspect::ListChildren => Fingerprint::ListChildren(data.list_children().to_vec()),
            Aspect::MapChildren => Fingerprint::MapChildren(data.map_children().clone()),
            Aspect::LastUpdate => Fingerprint::LastUpdate(data.last_update()),
        }
    }
}

/// A read of one aspect of one node.
#[derive(Clone)]
pub struct NodeUsage {
    tree: SignalTree,
    id: Id,
    resolved: Id,
    aspect: Aspect,
    fingerprint: Fingerprint,
}

impl NodeUsage {
    /// Record `aspect` of `id` as it is in `revision`.
    pub fn capture(tree: &SignalTree, revision: &TreeRevision, id: Id, aspect: Aspect) -> Self {
        Self {
            tree: tree.clone(),
            id,
            resolved: revision.resolve_alias(id),
            aspect,
            fingerprint: Fingerprint::capture(revision, id, aspect),
        }
    }

    pub fn aspect(&self) -> Aspect {
        self.aspect
    }
}

impl Usage for NodeUsage {
    fn has_changes(&self) -> bool {
        match Fingerprint::capture(&self.tree.read(), self.id, self.aspect) {
            // Removal alone does not invalidate a reader.
            Fingerprint::Missing => false,
            current => current != self.fingerprint,
        }
    }

    fn on_next_change(&self, listener: ChangeListener) -> Subscription {
        self.tree.with_lock(|| {
            if self.has_changes() && !listener() {
                return Subscription::empty();
            }
            let usage = self.clone();
            self.tree.observe_next_change(self.resolved, move || {
                if !usage.has_changes() {
                    return true;
                }
                listener()
            })
        })
    }

    fn covers(&self, tree: u64, id: Id) -> bool {
        self.tree.id() == tree && (self.id == id || self.resolved == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Runtime;
    use crate::tree::{Command, ListPosition};
    use serde_json::json;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn counter() -> (Arc<AtomicI32>, ChangeListener) {
        let calls = Arc::new(AtomicI32::new(0));
        let clone = calls.clone();
        (calls, Arc::new(move || {
            clone.fetch_add(1, Ordering::SeqCst);
            false
        }))
    }

    #[test]
    fn value_usage_ignores_unrelated_changes() {
        let tree = Runtime::new().local_tree();
        let usage = NodeUsage::capture(&tree, &tree.read(), Id::ZERO, Aspect::Value);
        let (calls, listener) = counter();
        let _subscription = usage.on_next_change(listener);

        tree.apply_locally(Command::insert(Id::ZERO, None, ListPosition::last()));
        assert!(!usage.has_changes());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tree.apply_locally(Command::set(Id::ZERO, Some(json!(1))));
        assert!(usage.has_changes());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn existing_change_is_reported_immediately() {
        let tree = Runtime::new().local_tree();
        let usage = NodeUsage::capture(&tree, &tree.read(), Id::ZERO, Aspect::LastUpdate);
        tree.apply_locally(Command::set(Id::ZERO, Some(json!(1))));
        let (calls, listener) = counter();

        let _subscription = usage.on_next_change(listener);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tree.apply_locally(Command::set(Id::ZERO, Some(json!(2))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_is_not_a_change() {
        let tree = Runtime::new().local_tree();
        let insert = Command::insert(Id::ZERO, Some(json!("child")), ListPosition::last());
        tree.apply_locally(insert.clone());
        let usage = NodeUsage::capture(&tree, &tree.read(), insert.id, Aspect::Value);

        tree.apply_locally(Command::remove(insert.id, None));

        assert!(!usage.has_changes());
    }

    #[test]
    fn covers_matches_tree_and_node() {
        let runtime = Runtime::new();
        let tree = runtime.local_tree();
        let other = runtime.local_tree();
        let usage = NodeUsage::capture(&tree, &tree.read(), Id::ZERO, Aspect::Value);

        assert!(usage.covers(tree.id(), Id::ZERO));
        assert!(!usage.covers(other.id(), Id::ZERO));
        assert!(!usage.covers(tree.id(), Id::EDGE));
    }
}
