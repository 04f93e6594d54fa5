//! Commands and Command Results
//!
//! A [`Command`] is an immutable description of one intended state
//! transition or condition check. Commands never change anything by
//! themselves; they are the input of [`apply`](super::apply::apply).
//!
//! # Command Families
//!
//! - **Conditions** pass or fail without changing the tree. Staged
//!   transactions add [`CommandKind::LastUpdateCondition`] for every node
//!   they read.
//! - **Mutations** change values or structure and re-stamp `last_update`
//!   on the nodes they touch.
//! - **Composites** group other commands ([`CommandKind::Transaction`]) or
//!   replace the whole node map ([`CommandKind::Snapshot`]).
//!
//! Commands that create a node use their own id as the id of the new node.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::Id;
use super::node::Node;
use super::revision::TreeRevision;
use crate::error::OperationError;

/// A position in a list of children.
///
/// `after` and `before` name the neighbours the inserted child should end up
/// between. [`Id::EDGE`] stands for the start (as `after`) or the end (as
/// `before`) of the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPosition {
    pub after: Option<Id>,
    pub before: Option<Id>,
}

impl ListPosition {
    /// The start of the list.
    pub fn first() -> Self {
        Self { after: Some(Id::EDGE), before: None }
    }

    /// The end of the list.
    pub fn last() -> Self {
        Self { after: None, before: Some(Id::EDGE) }
    }

    /// Directly after `child`.
    pub fn after(child: Id) -> Self {
        Self { after: Some(child), before: None }
    }

    /// Directly before `child`.
    pub fn before(child: Id) -> Self {
        Self { after: None, before: Some(child) }
    }

    /// Between two adjacent children.
    pub fn between(after: Id, before: Id) -> Self {
        Self { after: Some(after), before: Some(before) }
    }
}

/// What a [`CommandKind::KeyCondition`] expects under its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyExpectation {
    /// Some child is mapped to the key.
    Present,
    /// No child is mapped to the key.
    Absent,
    /// The given node (after alias resolution) is mapped to the key.
    Child(Id),
}

/// The closed set of command kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CommandKind {
    ValueCondition { expected: Option<Value> },
    PositionCondition { child: Id, position: ListPosition },
    KeyCondition { key: String, expected: KeyExpectation },
    LastUpdateCondition { expected: Id },

    Set { value: Option<Value> },
    Increment { delta: f64 },
    Insert { value: Option<Value>, scope_owner: Option<Id>, position: ListPosition },
    Put { key: String, value: Option<Value> },
    PutIfAbsent { key: String, value: Option<Value>, scope_owner: Option<Id> },
    AdoptAt { child: Id, position: ListPosition },
    AdoptAs { child: Id, key: String },
    Remove { expected_parent: Option<Id> },
    RemoveByKey { key: String },
    Clear,
    ClearOwner { owner: Id },

    Transaction { commands: Vec<Command> },
    Snapshot { nodes: BTreeMap<Id, Node> },
}

/// One command addressed at one target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Id,
    pub target: Id,
    pub kind: CommandKind,
}

impl Command {
    /// Wrap a kind with a fresh random command id.
    pub fn new(target: Id, kind: CommandKind) -> Self {
        Self { id: Id::random(), target, kind }
    }

    pub fn value_condition(target: Id, expected: Option<Value>) -> Self {
        Self::new(target, CommandKind::ValueCondition { expected })
    }

    pub fn position_condition(target: Id, child: Id, position: ListPosition) -> Self {
        Self::new(target, CommandKind::PositionCondition { child, position })
    }

    pub fn key_condition(target: Id, key: impl Into<String>, expected: KeyExpectation) -> Self {
        Self::new(target, CommandKind::KeyCondition { key: key.into(), expected })
    }

    pub fn last_update_condition(target: Id, expected: Id) -> Self {
        Self::new(target, CommandKind::LastUpdateCondition { expected })
    }

    pub fn set(target: Id, value: Option<Value>) -> Self {
        Self::new(target, CommandKind::Set { value })
    }

    pub fn increment(target: Id, delta: f64) -> Self {
        Self::new(target, CommandKind::Increment { delta })
    }

    pub fn insert(target: Id, value: Option<Value>, position: ListPosition) -> Self {
        Self::new(target, CommandKind::Insert { value, scope_owner: None, position })
    }

    pub fn put(target: Id, key: impl Into<String>, value: Option<Value>) -> Self {
        Self::new(target, CommandKind::Put { key: key.into(), value })
    }

    pub fn put_if_absent(target: Id, key: impl Into<String>, value: Option<Value>) -> Self {
        Self::new(
            target,
            CommandKind::PutIfAbsent { key: key.into(), value, scope_owner: None },
        )
    }

    pub fn adopt_at(target: Id, child: Id, position: ListPosition) -> Self {
        Self::new(target, CommandKind::AdoptAt { child, position })
    }

    pub fn adopt_as(target: Id, child: Id, key: impl Into<String>) -> Self {
        Self::new(target, CommandKind::AdoptAs { child, key: key.into() })
    }

    pub fn remove(target: Id, expected_parent: Option<Id>) -> Self {
        Self::new(target, CommandKind::Remove { expected_parent })
    }

    pub fn remove_by_key(target: Id, key: impl Into<String>) -> Self {
        Self::new(target, CommandKind::RemoveByKey { key: key.into() })
    }

    pub fn clear(target: Id) -> Self {
        Self::new(target, CommandKind::Clear)
    }

    /// Remove every node owned by `owner`. Always targets the root.
    pub fn clear_owner(owner: Id) -> Self {
        Self::new(Id::ZERO, CommandKind::ClearOwner { owner })
    }

    /// Group commands into one all-or-nothing batch.
    pub fn transaction(commands: Vec<Command>) -> Self {
        Self::new(Id::ZERO, CommandKind::Transaction { commands })
    }

    /// Replace the whole node map with the content of `revision`.
    pub fn snapshot(revision: &TreeRevision) -> Self {
        Self::new(Id::ZERO, CommandKind::Snapshot { nodes: revision.to_nodes() })
    }

    /// Tie the node created by an insert or put-if-absent to `owner`.
    ///
    /// Other kinds are returned unchanged.
    pub fn with_scope_owner(mut self, owner: Id) -> Self {
        match &mut self.kind {
            CommandKind::Insert { scope_owner, .. }
            | CommandKind::PutIfAbsent { scope_owner, .. } => *scope_owner = Some(owner),
            _ => {}
        }
        self
    }

    /// Whether this is a condition that never changes the tree.
    pub fn is_condition(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::ValueCondition { .. }
                | CommandKind::PositionCondition { .. }
                | CommandKind::KeyCondition { .. }
                | CommandKind::LastUpdateCondition { .. }
        )
    }

    /// The sub-commands of a transaction, empty for anything else.
    pub fn children(&self) -> &[Command] {
        match &self.kind {
            CommandKind::Transaction { commands } => commands,
            _ => &[],
        }
    }

    /// Node ids this command refers to besides its target.
    pub(crate) fn referenced_nodes(&self) -> Vec<Id> {
        let position_ids = |position: &ListPosition| {
            [position.after, position.before]
                .into_iter()
                .flatten()
                .filter(|id| *id != Id::EDGE)
                .collect::<Vec<_>>()
        };
        match &self.kind {
            CommandKind::PositionCondition { child, position }
            | CommandKind::AdoptAt { child, position } => {
                let mut ids = vec![*child];
                ids.extend(position_ids(position));
                ids
            }
            CommandKind::Insert { position, .. } => position_ids(position),
            CommandKind::AdoptAs { child, .. } => vec![*child],
            CommandKind::KeyCondition { expected: KeyExpectation::Child(child), .. } => {
                vec![*child]
            }
            CommandKind::Remove { expected_parent: Some(parent) } => vec![*parent],
            _ => Vec::new(),
        }
    }
}

/// The old and new state of one node touched by an accepted command.
///
/// `old` is `None` for created nodes and `new` is `None` for removed ones.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeModification {
    pub old: Option<Arc<Node>>,
    pub new: Option<Arc<Node>>,
}

/// A successfully applied command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accept {
    /// Every touched node, in the order it was first touched.
    pub updates: IndexMap<Id, NodeModification>,
    /// Accepts of the sub-commands of a transaction, nested ones included.
    pub nested: HashMap<Id, Accept>,
}

impl Accept {
    /// The modification recorded for `id`, if the command touched it.
    pub fn modification(&self, id: Id) -> Option<&NodeModification> {
        self.updates.get(&id)
    }
}

/// A command that failed a check. Nothing was changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// The innermost command whose check failed.
    pub command_id: Id,
    pub reason: String,
}

/// Outcome of applying one command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Accept(Accept),
    Reject(Reject),
}

impl CommandResult {
    pub(crate) fn reject(command_id: Id, reason: impl Into<String>) -> Self {
        CommandResult::Reject(Reject { command_id, reason: reason.into() })
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandResult::Accept(_))
    }

    pub fn as_accept(&self) -> Option<&Accept> {
        match self {
            CommandResult::Accept(accept) => Some(accept),
            CommandResult::Reject(_) => None,
        }
    }

    /// The reject reason, if rejected.
    pub fn reason(&self) -> Option<&str> {
        match self {
            CommandResult::Accept(_) => None,
            CommandResult::Reject(reject) => Some(&reject.reason),
        }
    }

    /// The result of the sub-command `id` of a transaction.
    ///
    /// A rejected transaction rejects every sub-command with the same reason.
    pub fn nested(&self, id: Id) -> CommandResult {
        match self {
            CommandResult::Accept(accept) => accept
                .nested
                .get(&id)
                .cloned()
                .map(CommandResult::Accept)
                .unwrap_or_default(),
            CommandResult::Reject(reject) => CommandResult::Reject(reject.clone()),
        }
    }

    pub fn into_result(self) -> Result<Accept, OperationError> {
        match self {
            CommandResult::Accept(accept) => Ok(accept),
            CommandResult::Reject(reject) => Err(OperationError::Rejected(reject.reason)),
        }
    }
}

impl Default for CommandResult {
    fn default() -> Self {
        CommandResult::Accept(Accept::default())
    }
}
