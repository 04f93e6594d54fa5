//! Staged transactions.
//!
//! A staged transaction buffers commands per tree and records a
//! `LastUpdateCondition` for every node read through it. Commit wraps each
//! tree's buffer in one transaction command: read conditions first, then the
//! mutations in issue order.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::Completion;
use crate::error::{OperationError, SignalError};
use crate::tree::{apply, Command, CommandResult, Id, Reject, ResultHandler, SignalTree, TreeRevision};

struct StagedTree {
    tree: SignalTree,
    /// Tree state at first touch. Read conditions are captured from here.
    base: TreeRevision,
    /// `base` plus every staged command.
    view: TreeRevision,
    read_ids: HashSet<Id>,
    conditions: Vec<Command>,
    commands: Vec<Command>,
    handlers: Vec<(Id, ResultHandler)>,
    rejection: Option<Reject>,
}

impl StagedTree {
    fn new(tree: &SignalTree) -> Self {
        let base = tree.read();
        Self {
            tree: tree.clone(),
            view: base.clone(),
            base,
            read_ids: HashSet::new(),
            conditions: Vec::new(),
            commands: Vec::new(),
            handlers: Vec::new(),
            rejection: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct StagedTransaction {
    trees: RefCell<Vec<StagedTree>>,
    completions: RefCell<Vec<Completion>>,
}

impl StagedTransaction {
    pub(crate) fn new(done: Completion) -> Self {
        let staged = Self::default();
        staged.completions.borrow_mut().push(done);
        staged
    }

    fn with_tree<R>(&self, tree: &SignalTree, f: impl FnOnce(&mut StagedTree) -> R) -> R {
        let mut trees = self.trees.borrow_mut();
        let index = match trees.iter().position(|staged| staged.tree == *tree) {
            Some(index) => index,
            None => {
                trees.push(StagedTree::new(tree));
                trees.len() - 1
            }
        };
        f(&mut trees[index])
    }

    /// The tree as seen from inside this transaction.
    pub(crate) fn view(&self, tree: &SignalTree) -> TreeRevision {
        self.with_tree(tree, |staged| staged.view.clone())
    }

    /// Record an optimistic read of `id`.
    pub(crate) fn register_read(&self, tree: &SignalTree, id: Id) {
        self.with_tree(tree, |staged| {
            if !staged.read_ids.insert(id) {
                return;
            }
            // Nodes created inside this transaction have nothing to protect.
            if let Some(data) = staged.base.data(id) {
                staged.conditions.push(Command::last_update_condition(id, data.last_update()));
            }
        });
    }

    pub(crate) fn include(
        &self,
        tree: &SignalTree,
        command: Command,
        handler: ResultHandler,
    ) -> Result<(), SignalError> {
        {
            let trees = self.trees.borrow();
            let mixed = trees
                .iter()
                .any(|staged| staged.tree != *tree && (tree.is_clustered() || staged.tree.is_clustered()));
            if mixed {
                return Err(SignalError::MixedTrees);
            }
        }

        self.with_tree(tree, |staged| {
            let applied = apply(&staged.view, &command);
            match applied.result {
                CommandResult::Accept(_) => staged.view = applied.revision,
                CommandResult::Reject(reject) => {
                    staged.rejection.get_or_insert(reject);
                }
            }
            staged.handlers.push((command.id, handler));
            staged.commands.push(command);
        });
        Ok(())
    }

    /// Fold a command that was applied directly to `tree` into this
    /// transaction, so later staged reads see it.
    pub(crate) fn fold(&self, tree: &SignalTree, command: &Command) {
        let mut trees = self.trees.borrow_mut();
        let Some(staged) = trees.iter_mut().find(|staged| staged.tree == *tree) else {
            return;
        };
        let on_base = apply(&staged.base, command);
        if on_base.result.is_accepted() {
            staged.base = on_base.revision;
        }
        let on_view = apply(&staged.view, command);
        if on_view.result.is_accepted() {
            staged.view = on_view.revision;
        }
    }

    pub(crate) fn add_completion(&self, done: Completion) {
        self.completions.borrow_mut().push(done);
    }

    /// Submit everything that was staged.
    ///
    /// Completions of nested transactions run before the outermost one.
    pub(crate) fn commit(&self) {
        let trees: Vec<StagedTree> = std::mem::take(&mut *self.trees.borrow_mut())
            .into_iter()
            .filter(|staged| !staged.commands.is_empty())
            .collect();
        let mut completions = std::mem::take(&mut *self.completions.borrow_mut());
        completions.rotate_left(1);
        let done: Completion = Box::new(move |outcome| {
            for completion in completions {
                completion(outcome.clone());
            }
        });

        if trees.is_empty() {
            done(Ok(()));
            return;
        }

        if let Some(reject) = trees.iter().find_map(|staged| staged.rejection.clone()) {
            debug!(command = %reject.command_id, reason = %reject.reason, "staged transaction failed locally");
            let result = CommandResult::Reject(reject.clone());
            for staged in trees {
                for (_, handler) in staged.handlers {
                    handler(&result);
                }
            }
            done(Err(OperationError::Rejected(reject.reason)));
            return;
        }

        let combiner = Arc::new(Mutex::new(Combiner { remaining: trees.len(), failure: None, done: Some(done) }));
        let mut batches: Vec<(SignalTree, Command, ResultHandler)> = trees
            .into_iter()
            .map(|staged| {
                let mut commands = staged.conditions;
                commands.extend(staged.commands);
                let command = Command::transaction(commands);
                let handlers = staged.handlers;
                let combiner = Arc::clone(&combiner);
                let handler: ResultHandler = Box::new(move |result: &CommandResult| {
                    for (id, handler) in handlers {
                        handler(&result.nested(id));
                    }
                    Combiner::record(&combiner, result);
                });
                (staged.tree, command, handler)
            })
            .collect();

        debug!(trees = batches.len(), "committing staged transaction");
        if batches.len() == 1 {
            if let Some((tree, command, handler)) = batches.pop() {
                tree.commit(command, Some(handler));
            }
        } else {
            SignalTree::commit_all(batches);
        }
    }
}

/// Collects the per-tree results of one commit into a single outcome.
struct Combiner {
    remaining: usize,
    failure: Option<OperationError>,
    done: Option<Completion>,
}

impl Combiner {
    fn record(this: &Mutex<Combiner>, result: &CommandResult) {
        let finished = {
            let mut combiner = this.lock();
            if let CommandResult::Reject(reject) = result {
                combiner.failure.get_or_insert_with(|| OperationError::Rejected(reject.reason.clone()));
            }
            combiner.remaining = combiner.remaining.saturating_sub(1);
            if combiner.remaining == 0 {
                combiner.done.take().map(|done| (done, combiner.failure.take()))
            } else {
                None
            }
        };
        if let Some((done, failure)) = finished {
            done(failure.map_or(Ok(()), Err));
        }
    }
}
