//! Tree Nodes
//!
//! This module defines the immutable node types that make up a tree
//! revision. A node is either a [`Data`] node holding a value and children,
//! or an alias that redirects to another data node.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::Id;

/// One addressable unit of tree state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Node {
    /// A node carrying a value and children.
    Data(Data),

    /// An indirection: this id currently refers to whatever `target`
    /// refers to.
    Alias {
        /// The data node this alias points to.
        target: Id,
    },
}

impl Node {
    /// The data of this node, if it is not an alias.
    pub fn as_data(&self) -> Option<&Data> {
        match self {
            Node::Data(data) => Some(data),
            Node::Alias { .. } => None,
        }
    }

    /// The alias target of this node, if it is an alias.
    pub fn alias_target(&self) -> Option<Id> {
        match self {
            Node::Data(_) => None,
            Node::Alias { target } => Some(*target),
        }
    }
}

/// A data node.
///
/// Data nodes are immutable. Every change produces a new instance through
/// one of the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    pub(crate) parent: Option<Id>,
    pub(crate) last_update: Id,
    pub(crate) scope_owner: Option<Id>,
    pub(crate) value: Option<Value>,
    pub(crate) list_children: Vec<Id>,
    pub(crate) map_children: IndexMap<String, Id>,
}

impl Data {
    /// Create a data node.
    ///
    /// A JSON `null` value is stored as "no value" so that two empty nodes
    /// always compare equal.
    pub fn new(
        parent: Option<Id>,
        last_update: Id,
        scope_owner: Option<Id>,
        value: Option<Value>,
        list_children: Vec<Id>,
        map_children: IndexMap<String, Id>,
    ) -> Self {
        Self {
            parent,
            last_update,
            scope_owner,
            value: normalize(value),
            list_children,
            map_children,
        }
    }

    /// An empty detached node.
    pub fn empty(last_update: Id) -> Self {
        Self::new(None, last_update, None, None, Vec::new(), IndexMap::new())
    }

    /// The parent id, `None` for the root and for detached nodes.
    pub fn parent(&self) -> Option<Id> {
        self.parent
    }

    /// The id of the command that last changed this node.
    pub fn last_update(&self) -> Id {
        self.last_update
    }

    /// The owner whose removal also removes this node.
    pub fn scope_owner(&self) -> Option<Id> {
        self.scope_owner
    }

    /// The node value.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Ordered list children.
    pub fn list_children(&self) -> &[Id] {
        &self.list_children
    }

    /// Keyed children in insertion order.
    pub fn map_children(&self) -> &IndexMap<String, Id> {
        &self.map_children
    }

    /// Whether `id` is a direct child in either collection.
    pub fn has_child(&self, id: Id) -> bool {
        self.list_children.contains(&id) || self.map_children.values().any(|c| *c == id)
    }

    /// Iterate all direct children, list children first.
    pub fn children(&self) -> impl Iterator<Item = Id> + '_ {
        self.list_children
            .iter()
            .copied()
            .chain(self.map_children.values().copied())
    }

    pub(crate) fn with_value(&self, value: Option<Value>, command: Id) -> Self {
        Self {
            last_update: command,
            value: normalize(value),
            ..self.clone()
        }
    }

    pub(crate) fn with_list_children(&self, list_children: Vec<Id>, command: Id) -> Self {
        Self {
            last_update: command,
            list_children,
            ..self.clone()
        }
    }

    pub(crate) fn with_map_children(
        &self,
        map_children: IndexMap<String, Id>,
        command: Id,
    ) -> Self {
        Self {
            last_update: command,
            map_children,
            ..self.clone()
        }
    }

    pub(crate) fn without_children(&self, command: Id) -> Self {
        Self {
            last_update: command,
            list_children: Vec::new(),
            map_children: IndexMap::new(),
            ..self.clone()
        }
    }

    /// Re-parenting keeps the node's own `last_update`.
    pub(crate) fn with_parent(&self, parent: Option<Id>) -> Self {
        Self {
            parent,
            ..self.clone()
        }
    }
}

fn normalize(value: Option<Value>) -> Option<Value> {
    match value {
        Some(Value::Null) | None => None,
        some => some,
    }
}
