//! The Command Algebra
//!
//! [`apply`] is a pure function from a revision and a command to a new
//! revision and a [`CommandResult`]. Signal trees are the only callers that
//! install its output.
//!
//! # How a Command Is Applied
//!
//! 1. The target is resolved through aliases. A missing target rejects with
//!    "Node not found".
//! 2. A [`Manipulator`] collects changed nodes and a set of detached nodes on
//!    top of the untouched base revision. Handlers read through this overlay,
//!    so later steps of a compound operation see earlier ones.
//! 3. Any failing check returns a [`Reject`] and the overlay is dropped.
//! 4. On success, detached subtrees are removed together with aliases that
//!    point into them and nodes scoped to a removed owner. The overlay becomes
//!    the [`Accept`] and the new revision.
//!
//! Transactions run their commands one by one against a scratch revision and
//! merge the accepts, so a condition late in a batch sees the effect of
//! earlier mutations in the same batch.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde_json::{Number, Value};

use super::command::{
    Accept, Command, CommandKind, CommandResult, KeyExpectation, ListPosition, NodeModification,
    Reject,
};
use super::id::Id;
use super::node::{Data, Node};
use super::revision::TreeRevision;

/// Output of [`apply`]. A rejected command leaves `revision` equal to the
/// input revision.
#[derive(Debug, Clone)]
pub struct Applied {
    pub revision: TreeRevision,
    pub result: CommandResult,
}

/// Apply one command to a revision.
pub fn apply(base: &TreeRevision, command: &Command) -> Applied {
    if base.data(command.target).is_none() {
        return rejected(base, CommandResult::reject(command.id, "Node not found"));
    }

    match &command.kind {
        CommandKind::Transaction { commands } => apply_transaction(base, commands),
        CommandKind::Snapshot { nodes } => {
            if !matches!(nodes.get(&Id::ZERO), Some(Node::Data(_))) {
                return rejected(base, CommandResult::reject(command.id, "Snapshot has no root"));
            }
            let revision = TreeRevision::from_nodes(nodes.clone());
            let mut updates = IndexMap::new();
            for (id, _) in base.iter() {
                if !revision.contains(id) {
                    updates.insert(
                        id,
                        NodeModification { old: base.node_arc(id).cloned(), new: None },
                    );
                }
            }
            for (id, _) in revision.iter() {
                updates.insert(
                    id,
                    NodeModification {
                        old: base.node_arc(id).cloned(),
                        new: revision.node_arc(id).cloned(),
                    },
                );
            }
            let accept = Accept { updates, nested: Default::default() };
            Applied { revision, result: CommandResult::Accept(accept) }
        }
        _ => {
            let mut manipulator = Manipulator::new(base, command.id);
            match manipulator.handle(command) {
                Ok(()) => {
                    let accept = manipulator.finish();
                    Applied {
                        revision: base.with_updates(&accept.updates),
                        result: CommandResult::Accept(accept),
                    }
                }
                Err(reject) => rejected(base, CommandResult::Reject(reject)),
            }
        }
    }
}

/// Apply a sequence of commands one after another, collecting every result.
pub fn apply_all(base: &TreeRevision, commands: &[Command]) -> (TreeRevision, Vec<CommandResult>) {
    let mut revision = base.clone();
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let applied = apply(&revision, command);
        revision = applied.revision;
        results.push(applied.result);
    }
    (revision, results)
}

fn rejected(base: &TreeRevision, result: CommandResult) -> Applied {
    Applied { revision: base.clone(), result }
}

fn apply_transaction(base: &TreeRevision, commands: &[Command]) -> Applied {
    let mut scratch = base.clone();
    let mut merged = Accept::default();

    for command in commands {
        let applied = apply(&scratch, command);
        let accept = match applied.result {
            CommandResult::Accept(accept) => accept,
            reject @ CommandResult::Reject(_) => return rejected(base, reject),
        };
        scratch = applied.revision;

        for (id, modification) in &accept.updates {
            match merged.updates.get_mut(id) {
                Some(existing) => existing.new = modification.new.clone(),
                None => {
                    merged.updates.insert(*id, modification.clone());
                }
            }
        }
        merged.nested.extend(accept.nested.iter().map(|(id, a)| (*id, a.clone())));
        merged.nested.insert(command.id, accept);
    }

    merged
        .updates
        .retain(|_, modification| modification.old.is_some() || modification.new.is_some());

    Applied { revision: scratch, result: CommandResult::Accept(merged) }
}

enum Attachment<'c> {
    At(&'c ListPosition),
    As(&'c str),
}

type Step = Result<(), Reject>;

/// Working state for one leaf command.
struct Manipulator<'a> {
    base: &'a TreeRevision,
    command: Id,
    updated: IndexMap<Id, Arc<Node>>,
    detached: IndexSet<Id>,
}

impl<'a> Manipulator<'a> {
    fn new(base: &'a TreeRevision, command: Id) -> Self {
        Self { base, command, updated: IndexMap::new(), detached: IndexSet::new() }
    }

    fn fail(&self, reason: &str) -> Reject {
        Reject { command_id: self.command, reason: reason.to_string() }
    }

    fn stored(&self, id: Id) -> Option<&Node> {
        match self.updated.get(&id) {
            Some(node) => Some(node.as_ref()),
            None => self.base.node(id),
        }
    }

    fn resolve(&self, id: Id) -> Id {
        match self.stored(id) {
            Some(Node::Alias { target }) => *target,
            _ => id,
        }
    }

    /// Data of an attached or untouched node. Detached nodes read as missing.
    fn data(&self, id: Id) -> Option<&Data> {
        let id = self.resolve(id);
        if self.detached.contains(&id) {
            return None;
        }
        self.stored(id).and_then(Node::as_data)
    }

    fn require(&self, id: Id) -> Result<(Id, Data), Reject> {
        let resolved = self.resolve(id);
        match self.data(resolved) {
            Some(data) => Ok((resolved, data.clone())),
            None => Err(self.fail("Node not found")),
        }
    }

    fn put(&mut self, id: Id, data: Data) {
        self.updated.insert(id, Arc::new(Node::Data(data)));
    }

    fn set_value(&mut self, id: Id, value: Option<Value>) -> Step {
        let (id, node) = self.require(id)?;
        self.put(id, node.with_value(value, self.command));
        Ok(())
    }

    fn map_child(&self, parent: Id, key: &str) -> Option<Id> {
        self.data(parent).and_then(|data| data.map_children.get(key).copied())
    }

    fn same_node(&self, a: Option<Id>, b: Option<Id>) -> bool {
        a.map(|id| self.resolve(id)) == b.map(|id| self.resolve(id))
    }

    fn is_child_at(&self, list: &[Id], index: Option<usize>, expected: Id) -> bool {
        let at = index.and_then(|index| list.get(index)).copied();
        self.same_node(at, Some(expected))
    }

    fn create(&mut self, id: Id, value: Option<Value>, scope_owner: Option<Id>) -> Step {
        if self.data(id).is_some() {
            return Err(self.fail("Node already exists"));
        }
        self.detached.insert(id);
        self.put(
            id,
            Data::new(None, self.command, scope_owner, value, Vec::new(), IndexMap::new()),
        );
        Ok(())
    }

    fn detach(&mut self, id: Id) -> Step {
        let (id, node) = self.require(id)?;
        if id == Id::ZERO {
            return Err(self.fail("Cannot detach the root"));
        }
        let parent = node.parent.ok_or_else(|| self.fail("Node is not attached"))?;
        let (parent, parent_data) = self.require(parent)?;

        let key = parent_data
            .map_children
            .iter()
            .find(|(_, child)| **child == id)
            .map(|(key, _)| key.clone());
        let updated = match key {
            Some(key) => {
                let mut map = parent_data.map_children.clone();
                map.shift_remove(&key);
                parent_data.with_map_children(map, self.command)
            }
            None => {
                let list = parent_data.list_children.iter().copied().filter(|c| *c != id).collect();
                parent_data.with_list_children(list, self.command)
            }
        };
        self.put(parent, updated);
        self.detached.insert(id);
        Ok(())
    }

    fn attach(&mut self, parent: Id, child: Id, attachment: Attachment<'_>) -> Step {
        let parent = self.resolve(parent);
        let child = self.resolve(child);

        if !self.detached.contains(&child) {
            return Err(self.fail("Node is not detached"));
        }

        let mut ancestor = Some(parent);
        while let Some(id) = ancestor {
            if id == child {
                return Err(self.fail("Cannot attach to own descendant"));
            }
            ancestor = self.data(id).and_then(Data::parent);
        }

        let (parent, parent_data) = self.require(parent)?;
        let updated = match attachment {
            Attachment::As(key) => {
                if parent_data.map_children.contains_key(key) {
                    return Err(self.fail("Key is in use"));
                }
                let mut map = parent_data.map_children.clone();
                map.insert(key.to_string(), child);
                parent_data.with_map_children(map, self.command)
            }
            Attachment::At(position) => {
                let index = self
                    .insert_index(&parent_data.list_children, position)
                    .ok_or_else(|| self.fail("Insert position not matched"))?;
                let mut list = parent_data.list_children.clone();
                list.insert(index, child);
                parent_data.with_list_children(list, self.command)
            }
        };

        self.detached.shift_remove(&child);
        let child_data = self
            .stored(child)
            .and_then(Node::as_data)
            .map(|data| data.with_parent(Some(parent)))
            .ok_or_else(|| self.fail("Node not found"))?;
        self.put(parent, updated);
        self.put(child, child_data);
        Ok(())
    }

    fn insert_index(&self, children: &[Id], position: &ListPosition) -> Option<usize> {
        let after = position.after.map(|id| self.resolve(id));
        let before = position.before.map(|id| self.resolve(id));
        let index_of = |id: Id| children.iter().position(|c| *c == id);

        match (after, before) {
            (Some(after), before) => {
                let index = if after == Id::EDGE { 0 } else { index_of(after)? + 1 };
                if let Some(before) = before {
                    let at = children.get(index).copied().unwrap_or(Id::EDGE);
                    if at != before {
                        return None;
                    }
                }
                Some(index)
            }
            (None, Some(before)) if before == Id::EDGE => Some(children.len()),
            (None, Some(before)) => index_of(before),
            (None, None) => None,
        }
    }

    fn handle(&mut self, command: &Command) -> Step {
        let target = command.target;
        match &command.kind {
            CommandKind::ValueCondition { expected } => {
                let actual = self.data(target).and_then(Data::value).unwrap_or(&Value::Null);
                let expected = expected.as_ref().unwrap_or(&Value::Null);
                self.check(actual == expected, "Unexpected value")
            }
            CommandKind::PositionCondition { child, position } => {
                self.check_position(target, *child, position)
            }
            CommandKind::KeyCondition { key, expected } => {
                let actual = self.map_child(target, key);
                match expected {
                    KeyExpectation::Present => self.check(actual.is_some(), "Key not present"),
                    KeyExpectation::Absent => self.check(actual.is_none(), "A key is present"),
                    KeyExpectation::Child(child) => {
                        self.check(self.same_node(actual, Some(*child)), "Unexpected child")
                    }
                }
            }
            CommandKind::LastUpdateCondition { expected } => {
                let actual = self.data(target).map(Data::last_update);
                self.check(actual == Some(*expected), "Unexpected last update")
            }

            CommandKind::Set { value } => self.set_value(target, value.clone()),
            CommandKind::Increment { delta } => {
                let current = match self.data(target).and_then(Data::value) {
                    None => 0.0,
                    Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
                    Some(_) => return Err(self.fail("Value is not numeric")),
                };
                let next = Number::from_f64(current + delta)
                    .ok_or_else(|| self.fail("Value is not numeric"))?;
                self.set_value(target, Some(Value::Number(next)))
            }
            CommandKind::Insert { value, scope_owner, position } => {
                self.create(command.id, value.clone(), *scope_owner)?;
                self.attach(target, command.id, Attachment::At(position))
            }
            CommandKind::Put { key, value } => match self.map_child(target, key) {
                Some(child) => self.set_value(child, value.clone()),
                None => {
                    self.create(command.id, value.clone(), None)?;
                    self.attach(target, command.id, Attachment::As(key))
                }
            },
            CommandKind::PutIfAbsent { key, value, scope_owner } => {
                match self.map_child(target, key) {
                    Some(child) => {
                        if self.data(command.id).is_some() {
                            return Err(self.fail("Node already exists"));
                        }
                        let alias = Node::Alias { target: self.resolve(child) };
                        self.updated.insert(command.id, Arc::new(alias));
                        Ok(())
                    }
                    None => {
                        self.create(command.id, value.clone(), *scope_owner)?;
                        self.attach(target, command.id, Attachment::As(key))
                    }
                }
            }
            CommandKind::AdoptAt { child, position } => {
                self.detach(*child)?;
                self.attach(target, *child, Attachment::At(position))
            }
            CommandKind::AdoptAs { child, key } => {
                self.detach(*child)?;
                self.attach(target, *child, Attachment::As(key))
            }
            CommandKind::Remove { expected_parent } => {
                if let Some(expected) = expected_parent {
                    let parent = self.data(target).and_then(Data::parent);
                    if !self.same_node(Some(*expected), parent) {
                        return Err(self.fail("Not a child"));
                    }
                }
                self.detach(target)
            }
            CommandKind::RemoveByKey { key } => {
                let child = self.map_child(target, key).ok_or_else(|| self.fail("Key not present"))?;
                self.detach(child)
            }
            CommandKind::Clear => {
                let (id, node) = self.require(target)?;
                let children: Vec<Id> = node.children().collect();
                if !children.is_empty() {
                    self.detached.extend(children);
                    self.put(id, node.without_children(self.command));
                }
                Ok(())
            }
            CommandKind::ClearOwner { owner } => {
                let mut owned: Vec<Id> = self
                    .base
                    .iter()
                    .filter(|(_, node)| {
                        node.as_data().and_then(Data::scope_owner) == Some(*owner)
                    })
                    .map(|(id, _)| id)
                    .collect();
                owned.sort_unstable();
                for id in owned {
                    if self.is_attached(id) {
                        self.detach(id)?;
                    }
                }
                Ok(())
            }

            CommandKind::Transaction { .. } | CommandKind::Snapshot { .. } => {
                Err(self.fail("Composite command in leaf position"))
            }
        }
    }

    fn check(&self, passed: bool, reason: &str) -> Step {
        if passed {
            Ok(())
        } else {
            Err(self.fail(reason))
        }
    }

    fn check_position(&self, target: Id, child: Id, position: &ListPosition) -> Step {
        let child = self.resolve(child);
        let list = self.data(target).map(|data| data.list_children.as_slice()).unwrap_or(&[]);
        let index = list
            .iter()
            .position(|c| *c == child)
            .ok_or_else(|| self.fail("Not a child"))?;

        match position.after {
            Some(Id::EDGE) if index != 0 => return Err(self.fail("Not the first child")),
            Some(Id::EDGE) | None => {}
            Some(after) => {
                if !self.is_child_at(list, index.checked_sub(1), after) {
                    return Err(self.fail("Not after the provided child"));
                }
            }
        }
        match position.before {
            Some(Id::EDGE) if index + 1 != list.len() => Err(self.fail("Not the last child")),
            Some(Id::EDGE) | None => Ok(()),
            Some(before) => self.check(
                self.is_child_at(list, Some(index + 1), before),
                "Not before the provided child",
            ),
        }
    }

    /// Whether `id` and all of its ancestors are still attached.
    fn is_attached(&self, mut id: Id) -> bool {
        loop {
            if id == Id::ZERO {
                return true;
            }
            match self.data(id).and_then(Data::parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    /// Turn the overlay into an accept, removing everything that ended up
    /// detached.
    fn finish(mut self) -> Accept {
        let mut removed: IndexSet<Id> = IndexSet::new();
        let mut queue: Vec<Id> = self.detached.iter().copied().collect();

        loop {
            while let Some(id) = queue.pop() {
                if !removed.insert(id) {
                    continue;
                }
                if let Some(data) = self.stored(id).and_then(Node::as_data) {
                    queue.extend(data.children());
                }
            }

            let mut owned: Vec<Id> = self
                .base
                .iter()
                .map(|(id, _)| id)
                .chain(self.updated.keys().copied())
                .filter(|id| !removed.contains(id))
                .filter(|id| {
                    self.stored(*id)
                        .and_then(Node::as_data)
                        .and_then(Data::scope_owner)
                        .map_or(false, |owner| removed.contains(&owner))
                })
                .collect();
            if owned.is_empty() {
                break;
            }
            owned.sort_unstable();
            owned.dedup();
            for id in owned {
                if self.is_attached(id) && self.detach(id).is_err() {
                    tracing::trace!(node = %id, "owned node could not be unlinked");
                }
                queue.push(id);
            }
        }

        let aliases: Vec<Id> = self
            .base
            .iter()
            .map(|(id, _)| id)
            .chain(self.updated.keys().copied())
            .filter(|id| {
                self.stored(*id)
                    .and_then(Node::alias_target)
                    .map_or(false, |target| removed.contains(&target))
            })
            .collect();
        removed.extend(aliases);

        let mut updates = IndexMap::new();
        for (id, node) in &self.updated {
            if !removed.contains(id) {
                updates.insert(
                    *id,
                    NodeModification {
                        old: self.base.node_arc(*id).cloned(),
                        new: Some(Arc::clone(node)),
                    },
                );
            }
        }
        for id in removed {
            if let Some(old) = self.base.node_arc(id) {
                updates.insert(id, NodeModification { old: Some(Arc::clone(old)), new: None });
            }
        }

        Accept { updates, nested: Default::default() }
    }
}
