//! Node Signals
//!
//! A [`NodeSignal`] is a read/write handle onto one node of a signal tree.
//!
//! # How Node Signals Work
//!
//! 1. Reads go through the current transaction. Tracked reads also record
//!    a [`NodeUsage`] with the usage tracker and, inside a staged
//!    transaction, an optimistic read condition.
//!
//! 2. Writes build a [`Command`], pass it through the handle's validators,
//!    and hand it to the current transaction. The returned
//!    [`PendingResult`] resolves with the tree's verdict.
//!
//! 3. [`NodeSignal::update`] combines both: read, compute, write in a staged
//!    transaction, and try again whenever a concurrent writer got there first.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use super::context::UsageTracker;
use super::usage::{Aspect, NodeUsage};
use crate::codec;
use crate::error::{OperationError, SignalError};
use crate::transaction::{pending, PendingResult, Resolver, Transaction};
use crate::tree::{
    Accept, Command, CommandKind, CommandResult, Data, Id, KeyExpectation, ListPosition, Node,
    NodeModification, ResultHandler, SignalTree, TreeRevision,
};

type Validator = Arc<dyn Fn(&Command) -> bool + Send + Sync>;

/// Predicates a command must pass before a handle submits it.
///
/// The empty list accepts anything. Condition commands are never checked,
/// and transaction commands are checked through their children.
#[derive(Clone, Default)]
pub struct Validators(Vec<Validator>);

impl Validators {
    pub fn anything() -> Self {
        Self::default()
    }

    /// Refuses every mutation.
    pub fn read_only() -> Self {
        Self::anything().with(|_| false)
    }

    pub fn with(mut self, validator: impl Fn(&Command) -> bool + Send + Sync + 'static) -> Self {
        self.0.push(Arc::new(validator));
        self
    }

    pub fn and(mut self, other: Validators) -> Self {
        if self.is_permissive() {
            return other;
        }
        self.0.extend(other.0);
        self
    }

    pub fn is_permissive(&self) -> bool {
        self.0.is_empty()
    }

    pub fn accepts(&self, command: &Command) -> bool {
        match &command.kind {
            _ if command.is_condition() => true,
            CommandKind::Transaction { commands } => commands.iter().all(|c| self.accepts(c)),
            _ => self.0.iter().all(|validator| validator(command)),
        }
    }

    fn check(&self, command: &Command) -> Result<(), SignalError> {
        if self.accepts(command) {
            Ok(())
        } else {
            Err(SignalError::Unsupported(format!("{} refused on node {}", kind_name(command), command.target)))
        }
    }
}

impl fmt::Debug for Validators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validators({})", self.0.len())
    }
}

fn kind_name(command: &Command) -> &'static str {
    match command.kind {
        CommandKind::ValueCondition { .. } => "value condition",
        CommandKind::PositionCondition { .. } => "position condition",
        CommandKind::KeyCondition { .. } => "key condition",
        CommandKind::LastUpdateCondition { .. } => "last update condition",
        CommandKind::Set { .. } => "set",
        CommandKind::Increment { .. } => "increment",
        CommandKind::Insert { .. } => "insert",
        CommandKind::Put { .. } => "put",
        CommandKind::PutIfAbsent { .. } => "put if absent",
        CommandKind::AdoptAt { .. } => "adopt at",
        CommandKind::AdoptAs { .. } => "adopt as",
        CommandKind::Remove { .. } => "remove",
        CommandKind::RemoveByKey { .. } => "remove by key",
        CommandKind::Clear => "clear",
        CommandKind::ClearOwner { .. } => "clear owner",
        CommandKind::Transaction { .. } => "transaction",
        CommandKind::Snapshot { .. } => "snapshot",
    }
}

/// A newly created child and the result of creating it.
#[derive(Debug)]
pub struct InsertOperation {
    pub signal: NodeSignal,
    pub result: PendingResult<()>,
}

/// A running [`NodeSignal::update`].
#[derive(Debug)]
pub struct UpdateOperation {
    result: PendingResult<()>,
    cancelled: Arc<AtomicBool>,
}

impl UpdateOperation {
    /// Stop retrying. An attempt already submitted still completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn result(&mut self) -> &mut PendingResult<()> {
        &mut self.result
    }

    pub fn into_result(self) -> PendingResult<()> {
        self.result
    }
}

/// A handle onto one node of a [`SignalTree`].
#[derive(Clone)]
pub struct NodeSignal {
    tree: SignalTree,
    id: Id,
    validators: Validators,
}

impl NodeSignal {
    pub(crate) fn new(tree: SignalTree, id: Id) -> Self {
        Self { tree, id, validators: Validators::anything() }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn tree(&self) -> &SignalTree {
        &self.tree
    }

    /// A handle that also applies `validator`.
    pub fn with_validator(&self, validator: impl Fn(&Command) -> bool + Send + Sync + 'static) -> Self {
        self.with_validators(Validators::anything().with(validator))
    }

    pub fn with_validators(&self, validators: Validators) -> Self {
        Self { validators: self.validators.clone().and(validators), ..self.clone() }
    }

    /// A handle that refuses every mutation.
    pub fn as_readonly(&self) -> Self {
        self.with_validators(Validators::read_only())
    }

    /// Child handles share this handle's validators.
    fn handle(&self, id: Id) -> Self {
        Self { tree: self.tree.clone(), id, validators: self.validators.clone() }
    }

    // ---- Reads ----

    fn tracked(&self, aspect: Aspect) -> TreeRevision {
        let transaction = Transaction::current();
        let revision = transaction.read(&self.tree);
        transaction.register_read(&self.tree, self.id);
        if UsageTracker::is_active() {
            UsageTracker::register(Arc::new(NodeUsage::capture(&self.tree, &revision, self.id, aspect)));
        }
        revision
    }

    /// The value decoded as `T`. Records a dependency on the value.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T, SignalError> {
        let revision = self.tracked(Aspect::Value);
        codec::decode(revision.data(self.id).and_then(Data::value))
    }

    pub fn value_json(&self) -> Option<Value> {
        let revision = self.tracked(Aspect::Value);
        revision.data(self.id).and_then(Data::value).cloned()
    }

    pub fn list_children(&self) -> Vec<NodeSignal> {
        let revision = self.tracked(Aspect::ListChildren);
        revision
            .data(self.id)
            .map(|data| data.list_children().iter().map(|id| self.handle(*id)).collect())
            .unwrap_or_default()
    }

    pub fn map_children(&self) -> IndexMap<String, NodeSignal> {
        let revision = self.tracked(Aspect::MapChildren);
        revision
            .data(self.id)
            .map(|data| {
                data.map_children()
                    .iter()
                    .map(|(key, id)| (key.clone(), self.handle(*id)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The whole node. Records a dependency on any change to it.
    pub fn state(&self) -> Option<Data> {
        let revision = self.tracked(Aspect::LastUpdate);
        revision.data(self.id).cloned()
    }

    /// The value, without recording a dependency.
    pub fn peek<T: DeserializeOwned>(&self) -> Result<T, SignalError> {
        let revision = Transaction::current().read(&self.tree);
        codec::decode(revision.data(self.id).and_then(Data::value))
    }

    /// The confirmed value, ignoring unconfirmed local changes.
    pub fn peek_confirmed<T: DeserializeOwned>(&self) -> Result<T, SignalError> {
        let revision = self.tree.confirmed();
        codec::decode(revision.data(self.id).and_then(Data::value))
    }

    // ---- Writes ----

    fn submit<T, M>(&self, command: Command, map: M) -> Result<PendingResult<T>, SignalError>
    where
        T: Send + 'static,
        M: FnOnce(Accept) -> T + Send + 'static,
    {
        self.validators.check(&command)?;
        if let Some(written) = written_node(&command) {
            UsageTracker::check_write(&self.tree, written)?;
        }

        let (resolver, result) = pending(self.tree.runtime());
        let handler: ResultHandler =
            Box::new(move |outcome: &CommandResult| resolver.resolve(outcome.clone().into_result().map(map)));
        Transaction::current().include(&self.tree, command, handler)?;
        Ok(result)
    }

    fn ensure_same_tree(&self, other: &NodeSignal) -> Result<(), SignalError> {
        if self.tree == other.tree {
            Ok(())
        } else {
            Err(SignalError::ForeignNode(other.id))
        }
    }

    /// Replace the value. Resolves with the previous value.
    pub fn set(&self, value: impl Serialize) -> Result<PendingResult<Option<Value>>, SignalError> {
        let command = Command::set(self.id, codec::encode(&value)?);
        self.submit(command, |accept| node_value(&accept, |m| m.old.as_deref()))
    }

    /// Add `delta` to a numeric value. Resolves with the new value.
    pub fn increment(&self, delta: f64) -> Result<PendingResult<f64>, SignalError> {
        let command = Command::increment(self.id, delta);
        self.submit(command, |accept| {
            node_value(&accept, |m| m.new.as_deref()).and_then(|v| v.as_f64()).unwrap_or(0.0)
        })
    }

    pub fn insert_child(
        &self,
        value: impl Serialize,
        position: ListPosition,
    ) -> Result<InsertOperation, SignalError> {
        self.insert(Command::insert(self.id, codec::encode(&value)?, position))
    }

    /// Insert a child that is removed together with `owner`.
    pub fn insert_child_owned(
        &self,
        value: impl Serialize,
        position: ListPosition,
        owner: &NodeSignal,
    ) -> Result<InsertOperation, SignalError> {
        self.ensure_same_tree(owner)?;
        self.insert(Command::insert(self.id, codec::encode(&value)?, position).with_scope_owner(owner.id))
    }

    fn insert(&self, command: Command) -> Result<InsertOperation, SignalError> {
        let signal = self.handle(command.id);
        let result = self.submit(command, |_| ())?;
        Ok(InsertOperation { signal, result })
    }

    /// Set the value of the child under `key`, creating it if needed.
    pub fn put_child(&self, key: impl Into<String>, value: impl Serialize) -> Result<PendingResult<()>, SignalError> {
        let command = Command::put(self.id, key, codec::encode(&value)?);
        self.submit(command, |_| ())
    }

    /// Create the child under `key` unless there is one.
    ///
    /// The returned handle refers to whichever child ends up under `key`.
    pub fn put_child_if_absent(
        &self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<InsertOperation, SignalError> {
        self.insert(Command::put_if_absent(self.id, key, codec::encode(&value)?))
    }

    /// Move `child` into this node's list.
    pub fn adopt_at(&self, child: &NodeSignal, position: ListPosition) -> Result<PendingResult<()>, SignalError> {
        self.ensure_same_tree(child)?;
        self.submit(Command::adopt_at(self.id, child.id, position), |_| ())
    }

    /// Move `child` into this node's map under `key`.
    pub fn adopt_as(&self, child: &NodeSignal, key: impl Into<String>) -> Result<PendingResult<()>, SignalError> {
        self.ensure_same_tree(child)?;
        self.submit(Command::adopt_as(self.id, child.id, key), |_| ())
    }

    /// Remove `child`, provided it is still a child of this node.
    pub fn remove_child(&self, child: &NodeSignal) -> Result<PendingResult<()>, SignalError> {
        self.ensure_same_tree(child)?;
        if child.id == Id::ZERO {
            return Err(SignalError::RootRemoval);
        }
        self.submit(Command::remove(child.id, Some(self.id)), |_| ())
    }

    /// Remove this node wherever it is.
    pub fn remove(&self) -> Result<PendingResult<()>, SignalError> {
        if self.id == Id::ZERO {
            return Err(SignalError::RootRemoval);
        }
        self.submit(Command::remove(self.id, None), |_| ())
    }

    pub fn remove_by_key(&self, key: impl Into<String>) -> Result<PendingResult<()>, SignalError> {
        self.submit(Command::remove_by_key(self.id, key), |_| ())
    }

    /// Remove every child.
    pub fn clear(&self) -> Result<PendingResult<()>, SignalError> {
        self.submit(Command::clear(self.id), |_| ())
    }

    /// Remove every node owned by this one.
    pub fn clear_owner(&self) -> Result<PendingResult<()>, SignalError> {
        self.submit(Command::clear_owner(self.id), |_| ())
    }

    pub fn verify_value(&self, expected: impl Serialize) -> Result<PendingResult<()>, SignalError> {
        let command = Command::value_condition(self.id, codec::encode(&expected)?);
        self.submit(command, |_| ())
    }

    pub fn verify_child_at(&self, child: &NodeSignal, position: ListPosition) -> Result<PendingResult<()>, SignalError> {
        self.ensure_same_tree(child)?;
        self.submit(Command::position_condition(self.id, child.id, position), |_| ())
    }

    pub fn verify_key(&self, key: impl Into<String>, expected: KeyExpectation) -> Result<PendingResult<()>, SignalError> {
        self.submit(Command::key_condition(self.id, key, expected), |_| ())
    }

    /// Replace the value with `update(current)`, retrying on conflicts.
    ///
    /// Each attempt is a staged transaction that reads the value and writes
    /// the result. An attempt rejected because the value changed in between
    /// is retried with the newer value. Inside an enclosing staged
    /// transaction there is exactly one attempt, and it resolves when the
    /// enclosing transaction commits.
    pub fn update<T, F>(&self, update: F) -> UpdateOperation
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnMut(T) -> T + Send + 'static,
    {
        let (resolver, result) = pending(self.tree.runtime());
        let cancelled = Arc::new(AtomicBool::new(false));
        let attempt = UpdateAttempt {
            signal: self.clone(),
            update: Arc::new(Mutex::new(update)),
            cancelled: Arc::clone(&cancelled),
            resolver,
            attempts: 0,
            retry: !Transaction::current().is_staged(),
            limit: self.tree.runtime().config().max_update_attempts,
            _value: PhantomData,
        };
        attempt.run();
        UpdateOperation { result, cancelled }
    }
}

/// The node a command writes, for effect loop detection.
fn written_node(command: &Command) -> Option<Id> {
    match command.kind {
        _ if command.is_condition() => None,
        CommandKind::ClearOwner { owner } => Some(owner),
        _ => Some(command.target),
    }
}

fn node_value(
    accept: &Accept,
    side: impl Fn(&NodeModification) -> Option<&Node>,
) -> Option<Value> {
    accept
        .updates
        .values()
        .next()
        .and_then(side)
        .and_then(Node::as_data)
        .and_then(|data| data.value().cloned())
}

struct UpdateAttempt<T, F> {
    signal: NodeSignal,
    update: Arc<Mutex<F>>,
    cancelled: Arc<AtomicBool>,
    resolver: Resolver<()>,
    attempts: usize,
    retry: bool,
    limit: Option<usize>,
    _value: PhantomData<fn() -> T>,
}

/// Commit outcome and body failure of one attempt.
type AttemptOutcome = (Result<(), OperationError>, Option<String>);

/// Meeting point between the loop that starts an attempt and whoever
/// delivers its outcome. An outcome delivered while the attempt is still
/// being started is picked up by the loop; a later one finds the attempt
/// parked here and continues it.
struct Handoff<A> {
    starting: bool,
    outcome: Option<AttemptOutcome>,
    parked: Option<A>,
}

impl<T, F> UpdateAttempt<T, F>
where
    T: Serialize + DeserializeOwned + 'static,
    F: FnMut(T) -> T + Send + 'static,
{
    /// Run attempts until one is left waiting for its result or the
    /// operation is resolved.
    fn run(self) {
        let mut attempt = self;
        loop {
            if attempt.cancelled.load(Ordering::SeqCst) {
                debug!(node = %attempt.signal.id, attempts = attempt.attempts, "update cancelled");
                attempt.resolver.resolve(Err(OperationError::Cancelled));
                return;
            }
            attempt.attempts += 1;

            let handoff = Arc::new(Mutex::new(Handoff { starting: true, outcome: None, parked: None }));
            attempt.start(Arc::clone(&handoff));

            let mut slot = handoff.lock();
            slot.starting = false;
            let Some((outcome, failed)) = slot.outcome.take() else {
                slot.parked = Some(attempt);
                return;
            };
            drop(slot);

            match attempt.settle(outcome, failed) {
                Some(retry) => attempt = retry,
                None => return,
            }
        }
    }

    /// Stage one read-compute-write and submit it.
    fn start(&self, handoff: Arc<Mutex<Handoff<Self>>>) {
        let signal = self.signal.clone();
        let update = Arc::clone(&self.update);
        let failure = Arc::new(Mutex::new(None::<String>));
        let body_failure = Arc::clone(&failure);

        Transaction::run_staged(
            move || {
                let outcome = signal.value::<T>().and_then(|current| {
                    let next = {
                        let mut update = update.lock();
                        (*update)(current)
                    };
                    signal.set(next).map(drop)
                });
                if let Err(err) = outcome {
                    *body_failure.lock() = Some(err.to_string());
                }
            },
            Box::new(move |outcome| {
                let failed = failure.lock().take();
                let parked = {
                    let mut slot = handoff.lock();
                    if slot.starting {
                        slot.outcome = Some((outcome, failed));
                        return;
                    }
                    slot.parked.take()
                };
                if let Some(retry) = parked.and_then(|attempt| attempt.settle(outcome, failed)) {
                    retry.run();
                }
            }),
        );
    }

    /// Resolve the operation, or hand the attempt back for another try.
    fn settle(self, outcome: Result<(), OperationError>, failed: Option<String>) -> Option<Self> {
        if let Some(message) = failed {
            self.resolver.resolve(Err(OperationError::Failed(message)));
            return None;
        }
        match outcome {
            Err(OperationError::Rejected(reason)) if self.retry => {
                if self.limit.is_some_and(|limit| self.attempts >= limit) {
                    debug!(node = %self.signal.id, attempts = self.attempts, "update gave up");
                    let attempts = self.attempts;
                    self.resolver.resolve(Err(OperationError::AttemptsExhausted(attempts)));
                    None
                } else {
                    trace!(node = %self.signal.id, attempt = self.attempts, %reason, "update conflicted, retrying");
                    Some(self)
                }
            }
            outcome => {
                self.resolver.resolve(outcome);
                None
            }
        }
    }
}

impl PartialEq for NodeSignal {
    fn eq(&self, other: &Self) -> bool {
        self.tree == other.tree && self.id == other.id
    }
}

impl fmt::Debug for NodeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSignal")
            .field("tree", &self.tree.id())
            .field("id", &self.id)
            .field("validators", &self.validators)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
