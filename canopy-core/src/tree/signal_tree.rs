//! Signal Tree Container
//!
//! A [`SignalTree`] owns the current state of one tree and is the only
//! place where new revisions are installed.
//!
//! # Locking
//!
//! State lives behind a reentrant mutex holding a `RefCell`. The mutex
//! serializes apply, install and notify for one batch. Reentrancy lets an
//! observer that runs during notification read the tree, observe it again
//! or commit to it. The `RefCell` borrow is never held while user code runs.
//!
//! Observers run with the lock held. Locks of other trees taken from an
//! observer therefore nest inside this one; see [`SignalTree::commit`].
//!
//! # Local and Clustered Trees
//!
//! A local tree applies commands straight to its confirmed revision.
//!
//! A clustered tree keeps the confirmed revision as delivered by the
//! cluster and layers an assumed revision on top of it: the confirmed state
//! plus every local command that has not been confirmed yet. Local commands
//! are forwarded to a [`CommandSink`] and their results resolve when the
//! transport calls [`SignalTree::confirm`].
//!
//! Reconciliation is a full replay. Confirmed commands are applied to the
//! confirmed revision in order, confirmed local commands leave the pending
//! queue, and the assumed revision is rebuilt from the remaining pending
//! commands. Every id that differs between the old and new assumed view is
//! notified, so a local command that the cluster rejected rolls back.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tracing::{debug, error, trace};

use super::apply::{apply, apply_all};
use super::command::{Command, CommandResult};
use super::id::Id;
use super::revision::TreeRevision;
use crate::error::SignalError;
use crate::reactive::{NodeSignal, Runtime, Subscription};
use crate::transaction::Transaction;

/// Callback receiving the result of one submitted top-level command.
pub(crate) type ResultHandler = Box<dyn FnOnce(&CommandResult) + Send>;

type Listener = Box<dyn FnMut() -> bool + Send>;
type ProcessedListener = Box<dyn FnMut(&Command, &CommandResult) + Send>;

/// Counter for generating tree ids.
static TREE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Counter for generating observer ids.
static OBSERVER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The cluster transport as seen from a clustered tree.
///
/// The sink receives every command submitted locally, in submission order.
/// It is expected to deliver the authoritative order back through
/// [`SignalTree::confirm`], together with commands from other members.
pub trait CommandSink: Send + Sync {
    fn submit(&self, tree: &SignalTree, commands: Vec<Command>);
}

impl<F> CommandSink for F
where
    F: Fn(&SignalTree, Vec<Command>) + Send + Sync,
{
    fn submit(&self, tree: &SignalTree, commands: Vec<Command>) {
        self(tree, commands)
    }
}

struct Observer {
    id: u64,
    cancelled: Arc<AtomicBool>,
    callback: Listener,
}

struct Processed {
    id: u64,
    cancelled: Arc<AtomicBool>,
    callback: ProcessedListener,
}

struct Pending {
    command: Command,
    handler: Option<ResultHandler>,
}

struct TreeState {
    confirmed: TreeRevision,
    assumed: Option<TreeRevision>,
    pending: Vec<Pending>,
    observers: HashMap<Id, Vec<Observer>>,
    processed: Vec<Processed>,
}

impl TreeState {
    fn view(&self) -> &TreeRevision {
        self.assumed.as_ref().unwrap_or(&self.confirmed)
    }
}

struct TreeInner {
    id: u64,
    runtime: Runtime,
    sink: Option<Arc<dyn CommandSink>>,
    state: ReentrantMutex<RefCell<TreeState>>,
}

/// A mutable tree of signals.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct SignalTree {
    inner: Arc<TreeInner>,
}

impl SignalTree {
    /// Create a tree that confirms its own commands.
    pub fn local(runtime: &Runtime) -> Self {
        Self::create(runtime, None)
    }

    /// Create a tree whose state is confirmed by a cluster transport.
    pub fn clustered(runtime: &Runtime, sink: Arc<dyn CommandSink>) -> Self {
        Self::create(runtime, Some(sink))
    }

    fn create(runtime: &Runtime, sink: Option<Arc<dyn CommandSink>>) -> Self {
        let id = TREE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        debug!(tree = id, clustered = sink.is_some(), "created signal tree");
        Self {
            inner: Arc::new(TreeInner {
                id,
                runtime: runtime.clone(),
                sink,
                state: ReentrantMutex::new(RefCell::new(TreeState {
                    confirmed: TreeRevision::new(),
                    assumed: None,
                    pending: Vec::new(),
                    observers: HashMap::new(),
                    processed: Vec::new(),
                })),
            }),
        }
    }

    /// Process-unique id of this tree. Also used as lock order.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_clustered(&self) -> bool {
        self.inner.sink.is_some()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// A handle to the root node.
    pub fn root(&self) -> NodeSignal {
        NodeSignal::new(self.clone(), Id::ZERO)
    }

    /// The current revision: assumed if there is one, otherwise confirmed.
    pub fn read(&self) -> TreeRevision {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.view().clone()
    }

    /// The latest confirmed revision.
    pub fn confirmed(&self) -> TreeRevision {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.confirmed.clone()
    }

    /// Number of local commands still waiting for confirmation.
    pub fn pending_count(&self) -> usize {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.pending.len()
    }

    /// Run `f` while holding the tree lock.
    ///
    /// Used for "check, then subscribe" sequences that must not miss a
    /// change happening in between.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.state.lock();
        f()
    }

    /// Apply a command to the current state and return the local result.
    ///
    /// On a clustered tree the command also enters the pending queue and is
    /// forwarded to the sink; the returned result is only the assumed one.
    pub fn apply_locally(&self, command: Command) -> CommandResult {
        self.commit(command, None)
    }

    /// Apply `command`, install the result and notify observers.
    ///
    /// The tree lock is held until observers have run, and with the
    /// immediate dispatcher that includes effect re-runs. An observer that
    /// writes a second tree takes that tree's lock while holding this one,
    /// so two threads writing each other's trees from observers can
    /// deadlock. Effects like that belong on a queued dispatcher, see
    /// `ExecutionHooks::with_effect_dispatcher`.
    pub(crate) fn commit(&self, command: Command, mut handler: Option<ResultHandler>) -> CommandResult {
        let guard = self.inner.state.lock();
        let clustered = self.is_clustered();

        let (result, changed) = {
            let mut state = guard.borrow_mut();
            let applied = apply(state.view(), &command);
            let changed: Vec<Id> = applied
                .result
                .as_accept()
                .map(|accept| accept.updates.keys().copied().collect())
                .unwrap_or_default();

            if applied.result.is_accepted() {
                self.check(&applied.revision);
                if clustered {
                    state.assumed = Some(applied.revision);
                } else {
                    state.confirmed = applied.revision;
                }
            }
            if clustered {
                state.pending.push(Pending { command: command.clone(), handler: handler.take() });
            }
            (applied.result, changed)
        };

        self.log_result(&command, &result, changed.len());

        if !clustered {
            self.fire_processed(&command, &result);
            if let Some(handler) = handler {
                handler(&result);
            }
        }
        self.notify(&changed);

        if let Some(sink) = &self.inner.sink {
            sink.submit(self, vec![command]);
        }
        drop(guard);
        result
    }

    /// Commit one batch per tree. Either every batch is installed or none.
    ///
    /// Locks are taken in tree id order. Only local trees may take part.
    pub(crate) fn commit_all(mut batches: Vec<(SignalTree, Command, ResultHandler)>) {
        batches.sort_by_key(|(tree, _, _)| tree.id());
        let trees: Vec<SignalTree> = batches.iter().map(|(tree, _, _)| tree.clone()).collect();
        let guards: Vec<_> = trees.iter().map(|tree| tree.inner.state.lock()).collect();

        let mut applied = Vec::with_capacity(batches.len());
        let mut failure: Option<CommandResult> = None;
        for ((_, command, _), guard) in batches.iter().zip(&guards) {
            let result = apply(guard.borrow().view(), command);
            if failure.is_none() && !result.result.is_accepted() {
                failure = Some(result.result.clone());
            }
            applied.push(result);
        }

        let mut notifications = Vec::new();
        for (((tree, command, handler), guard), applied) in
            batches.into_iter().zip(&guards).zip(applied)
        {
            let result = match &failure {
                Some(reject) if applied.result.is_accepted() => reject.clone(),
                Some(_) => applied.result,
                None => {
                    tree.check(&applied.revision);
                    guard.borrow_mut().confirmed = applied.revision;
                    applied.result
                }
            };
            let changed: Vec<Id> = match (&failure, result.as_accept()) {
                (None, Some(accept)) => accept.updates.keys().copied().collect(),
                _ => Vec::new(),
            };
            tree.log_result(&command, &result, changed.len());
            tree.fire_processed(&command, &result);
            handler(&result);
            notifications.push((tree, changed));
        }

        for (tree, changed) in notifications {
            tree.notify(&changed);
        }
        drop(guards);
    }

    /// Deliver the authoritative command order of a clustered tree.
    pub fn confirm(&self, commands: Vec<Command>) -> Result<(), SignalError> {
        if !self.is_clustered() {
            return Err(SignalError::NotClustered);
        }
        let guard = self.inner.state.lock();

        let (resolved, changed, pending) = {
            let mut state = guard.borrow_mut();
            let old_view = state.view().clone();
            let mut resolved = Vec::with_capacity(commands.len());

            for command in commands {
                let applied = apply(&state.confirmed, &command);
                state.confirmed = applied.revision;
                let handler = state
                    .pending
                    .iter()
                    .position(|p| p.command.id == command.id)
                    .and_then(|index| state.pending.remove(index).handler);
                resolved.push((command, applied.result, handler));
            }
            self.check(&state.confirmed);

            state.assumed = if state.pending.is_empty() {
                None
            } else {
                let replay: Vec<Command> = state.pending.iter().map(|p| p.command.clone()).collect();
                Some(apply_all(&state.confirmed, &replay).0)
            };

            let changed = state.view().changed_ids(&old_view);
            (resolved, changed, state.pending.len())
        };

        debug!(
            tree = self.id(),
            confirmed = resolved.len(),
            pending,
            changed = changed.len(),
            "reconciled clustered tree"
        );

        for (command, result, handler) in resolved {
            self.log_result(&command, &result, 0);
            self.fire_processed(&command, &result);
            if let Some(handler) = handler {
                handler(&result);
            }
        }
        self.notify(&changed);
        drop(guard);
        Ok(())
    }

    /// Call `listener` the next time the node stored under `id` changes.
    ///
    /// The listener returns `true` to keep observing. Listeners added while
    /// a notification for `id` is running only see later changes.
    pub fn observe_next_change(
        &self,
        id: Id,
        listener: impl FnMut() -> bool + Send + 'static,
    ) -> Subscription {
        let observer_id = OBSERVER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();
            state.observers.entry(id).or_default().push(Observer {
                id: observer_id,
                cancelled: Arc::clone(&cancelled),
                callback: Box::new(listener),
            });
        }

        let tree = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            cancelled.store(true, Ordering::SeqCst);
            with_state(&tree, |state| {
                if let Some(observers) = state.observers.get_mut(&id) {
                    observers.retain(|o| o.id != observer_id);
                    if observers.is_empty() {
                        state.observers.remove(&id);
                    }
                }
            });
        })
    }

    /// Call `listener` for every processed top-level command.
    ///
    /// Local trees report commands as they commit; clustered trees report
    /// them as they are confirmed.
    pub fn subscribe_to_processed(
        &self,
        listener: impl FnMut(&Command, &CommandResult) + Send + 'static,
    ) -> Subscription {
        let listener_id = OBSERVER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let guard = self.inner.state.lock();
            guard.borrow_mut().processed.push(Processed {
                id: listener_id,
                cancelled: Arc::clone(&cancelled),
                callback: Box::new(listener),
            });
        }

        let tree = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            cancelled.store(true, Ordering::SeqCst);
            with_state(&tree, |state| state.processed.retain(|p| p.id != listener_id));
        })
    }

    fn notify(&self, ids: &[Id]) {
        for id in ids {
            let taken = {
                let guard = self.inner.state.lock();
                let mut state = guard.borrow_mut();
                state.observers.remove(id)
            };
            let Some(observers) = taken else { continue };

            let mut kept = Vec::new();
            Transaction::run_without_transaction(|| {
                for mut observer in observers {
                    if observer.cancelled.load(Ordering::SeqCst) {
                        continue;
                    }
                    trace!(tree = self.id(), node = %id, "waking observer");
                    if (observer.callback)() && !observer.cancelled.load(Ordering::SeqCst) {
                        kept.push(observer);
                    }
                }
            });

            if !kept.is_empty() {
                let guard = self.inner.state.lock();
                let mut state = guard.borrow_mut();
                let entry = state.observers.entry(*id).or_default();
                kept.append(entry);
                *entry = kept;
            }
        }
    }

    fn fire_processed(&self, command: &Command, result: &CommandResult) {
        let mut listeners = {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();
            std::mem::take(&mut state.processed)
        };
        if listeners.is_empty() {
            return;
        }

        Transaction::run_without_transaction(|| {
            for listener in listeners.iter_mut() {
                if !listener.cancelled.load(Ordering::SeqCst) {
                    (listener.callback)(command, result);
                }
            }
        });

        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        listeners.retain(|l| !l.cancelled.load(Ordering::SeqCst));
        listeners.append(&mut state.processed);
        state.processed = listeners;
    }

    fn check(&self, revision: &TreeRevision) {
        if !self.inner.runtime.config().validate_revisions {
            return;
        }
        if let Err(violation) = revision.validate() {
            error!(tree = self.id(), %violation, "installed revision violates tree invariants");
        }
    }

    fn log_result(&self, command: &Command, result: &CommandResult, touched: usize) {
        match result {
            CommandResult::Accept(_) => {
                debug!(tree = self.id(), command = %command.id, touched, "command accepted");
            }
            CommandResult::Reject(reject) => {
                if self.inner.runtime.config().log_rejections {
                    debug!(tree = self.id(), command = %command.id, reason = %reject.reason, "command rejected");
                } else {
                    trace!(tree = self.id(), command = %command.id, reason = %reject.reason, "command rejected");
                }
            }
        }
    }
}

fn with_state(tree: &Weak<TreeInner>, f: impl FnOnce(&mut TreeState)) {
    let Some(inner) = tree.upgrade() else { return };
    let guard = inner.state.lock();
    // A cancel issued while the state is borrowed relies on the flag alone.
    if let Ok(mut state) = guard.try_borrow_mut() {
        f(&mut state);
    };
}

impl PartialEq for SignalTree {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SignalTree {}

impl fmt::Debug for SignalTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalTree")
            .field("id", &self.id())
            .field("clustered", &self.is_clustered())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ListPosition;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicI32;

    #[derive(Default)]
    struct RecordingSink {
        submitted: Mutex<Vec<Command>>,
    }

    impl CommandSink for RecordingSink {
        fn submit(&self, _tree: &SignalTree, commands: Vec<Command>) {
            self.submitted.lock().extend(commands);
        }
    }

    fn value(revision: &TreeRevision, id: Id) -> Option<serde_json::Value> {
        revision.data(id).and_then(|d| d.value()).cloned()
    }

    #[test]
    fn local_commit_installs_confirmed_revision() {
        let tree = SignalTree::local(&Runtime::new());

        let result = tree.apply_locally(Command::set(Id::ZERO, Some(json!(1))));

        assert!(result.is_accepted());
        assert_eq!(value(&tree.read(), Id::ZERO), Some(json!(1)));
        assert_eq!(tree.read(), tree.confirmed());
    }

    #[test]
    fn observers_fire_until_they_decline() {
        let tree = SignalTree::local(&Runtime::new());
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let _subscription = tree.observe_next_change(Id::ZERO, move || {
            calls_clone.fetch_add(1, Ordering::SeqCst) < 1
        });

        tree.apply_locally(Command::set(Id::ZERO, Some(json!(1))));
        tree.apply_locally(Command::set(Id::ZERO, Some(json!(2))));
        tree.apply_locally(Command::set(Id::ZERO, Some(json!(3))));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelled_observer_is_not_called() {
        let tree = SignalTree::local(&Runtime::new());
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let subscription = tree.observe_next_change(Id::ZERO, move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            true
        });
        subscription.cancel();
        tree.apply_locally(Command::set(Id::ZERO, Some(json!(1))));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observer_added_during_notification_sees_only_later_changes() {
        let tree = SignalTree::local(&Runtime::new());
        let inner_calls = Arc::new(AtomicI32::new(0));

        let tree_clone = tree.clone();
        let inner_clone = inner_calls.clone();
        let _outer = tree.observe_next_change(Id::ZERO, move || {
            let counter = inner_clone.clone();
            let _inner = tree_clone.observe_next_change(Id::ZERO, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            });
            false
        });

        tree.apply_locally(Command::set(Id::ZERO, Some(json!(1))));
        assert_eq!(inner_calls.load(Ordering::SeqCst), 0);

        tree.apply_locally(Command::set(Id::ZERO, Some(json!(2))));
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_can_commit_to_the_same_tree() {
        let tree = SignalTree::local(&Runtime::new());
        let child = Command::put(Id::ZERO, "mirror", None);
        tree.apply_locally(child.clone());

        let tree_clone = tree.clone();
        let mirror = child.id;
        let _subscription = tree.observe_next_change(Id::ZERO, move || {
            let current = tree_clone.read().data(Id::ZERO).and_then(|d| d.value()).cloned();
            tree_clone.apply_locally(Command::set(mirror, current));
            true
        });

        tree.apply_locally(Command::set(Id::ZERO, Some(json!("copied"))));

        assert_eq!(value(&tree.read(), mirror), Some(json!("copied")));
    }

    #[test]
    fn observer_writes_to_another_tree_under_the_first_lock() {
        let runtime = Runtime::new();
        let source = SignalTree::local(&runtime);
        let target = SignalTree::local(&runtime);

        let held = Arc::new(Mutex::new(Vec::new()));
        let (source_clone, seen) = (source.clone(), held.clone());
        let _target_sub = target.observe_next_change(Id::ZERO, move || {
            seen.lock().push(source_clone.inner.state.is_locked());
            true
        });
        let target_clone = target.clone();
        let _source_sub = source.observe_next_change(Id::ZERO, move || {
            target_clone.apply_locally(Command::set(Id::ZERO, Some(json!("forwarded"))));
            true
        });

        source.apply_locally(Command::set(Id::ZERO, Some(json!(1))));

        assert_eq!(*held.lock(), vec![true]);
        assert!(!source.inner.state.is_locked());
        assert_eq!(value(&target.read(), Id::ZERO), Some(json!("forwarded")));
    }

    #[test]
    fn processed_listeners_see_rejections() {
        let tree = SignalTree::local(&Runtime::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let subscription = tree.subscribe_to_processed(move |command, result| {
            seen_clone.lock().push((command.id, result.is_accepted()));
        });

        let ok = Command::set(Id::ZERO, Some(json!(1)));
        let bad = Command::set(Id::random(), Some(json!(1)));
        tree.apply_locally(ok.clone());
        tree.apply_locally(bad.clone());
        subscription.cancel();
        tree.apply_locally(Command::set(Id::ZERO, None));

        assert_eq!(*seen.lock(), vec![(ok.id, true), (bad.id, false)]);
    }

    #[test]
    fn clustered_tree_keeps_assumed_state_until_confirmed() {
        let sink = Arc::new(RecordingSink::default());
        let tree = SignalTree::clustered(&Runtime::new(), sink.clone());
        let command = Command::set(Id::ZERO, Some(json!("local")));

        assert!(tree.apply_locally(command.clone()).is_accepted());
        assert_eq!(value(&tree.read(), Id::ZERO), Some(json!("local")));
        assert_eq!(value(&tree.confirmed(), Id::ZERO), None);
        assert_eq!(tree.pending_count(), 1);
        assert_eq!(sink.submitted.lock().len(), 1);

        tree.confirm(vec![command]).unwrap();

        assert_eq!(tree.pending_count(), 0);
        assert_eq!(value(&tree.confirmed(), Id::ZERO), Some(json!("local")));
        assert_eq!(tree.read(), tree.confirmed());
    }

    #[test]
    fn rejected_confirmation_rolls_back_assumed_state() {
        let sink = Arc::new(RecordingSink::default());
        let tree = SignalTree::clustered(&Runtime::new(), sink);
        let child = Command::insert(Id::ZERO, Some(json!("mine")), ListPosition::last());
        let guarded = Command::transaction(vec![Command::value_condition(Id::ZERO, None), child.clone()]);
        tree.apply_locally(guarded.clone());
        assert!(tree.read().contains(child.id));

        let notified = Arc::new(AtomicI32::new(0));
        let notified_clone = notified.clone();
        let _subscription = tree.observe_next_change(child.id, move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
            false
        });

        // Another member wrote the root first, so our condition fails.
        let remote = Command::set(Id::ZERO, Some(json!("remote")));
        tree.confirm(vec![remote, guarded]).unwrap();

        assert!(!tree.read().contains(child.id));
        assert_eq!(value(&tree.read(), Id::ZERO), Some(json!("remote")));
        assert_eq!(tree.pending_count(), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn confirm_requires_clustered_tree() {
        let tree = SignalTree::local(&Runtime::new());

        assert!(matches!(tree.confirm(Vec::new()), Err(SignalError::NotClustered)));
    }

    #[test]
    fn commit_all_is_atomic_across_trees() {
        let runtime = Runtime::new();
        let a = SignalTree::local(&runtime);
        let b = SignalTree::local(&runtime);
        let results = Arc::new(Mutex::new(Vec::new()));

        let handler = |results: Arc<Mutex<Vec<bool>>>| -> ResultHandler {
            Box::new(move |result| results.lock().push(result.is_accepted()))
        };

        SignalTree::commit_all(vec![
            (a.clone(), Command::set(Id::ZERO, Some(json!("a"))), handler(results.clone())),
            (b.clone(), Command::set(Id::random(), Some(json!("b"))), handler(results.clone())),
        ]);
        assert_eq!(*results.lock(), vec![false, false]);
        assert_eq!(value(&a.read(), Id::ZERO), None);

        results.lock().clear();
        SignalTree::commit_all(vec![
            (a.clone(), Command::set(Id::ZERO, Some(json!("a"))), handler(results.clone())),
            (b.clone(), Command::set(Id::ZERO, Some(json!("b"))), handler(results.clone())),
        ]);
        assert_eq!(*results.lock(), vec![true, true]);
        assert_eq!(value(&a.read(), Id::ZERO), Some(json!("a")));
        assert_eq!(value(&b.read(), Id::ZERO), Some(json!("b")));
    }
}
