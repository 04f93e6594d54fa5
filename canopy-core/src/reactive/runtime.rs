//! Reactive Runtime
//!
//! The runtime is the context object every tree, effect and transaction is
//! created from. It carries the configuration and the execution hooks.
//!
//! # Execution Hooks
//!
//! Two things happen asynchronously from the point of view of the core:
//!
//! 1. Delivering a finished operation's result to its [`PendingResult`].
//!
//! 2. Re-running an effect after a change.
//!
//! Each is handed to an [`Executor`]. Hooks are consulted in registration
//! order and the first active hook that supplies an executor for the
//! purpose wins. Without one, the work runs immediately on the calling
//! thread.
//!
//! # Thread Safety
//!
//! A runtime is cheap to clone and can be shared across threads. It holds
//! no mutable state of its own.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::computed::Computed;
use super::effect::{Effect, EffectError};
use crate::config::SignalConfig;
use crate::error::SignalError;
use crate::transaction::{pending, PendingResult, Transaction, TransactionOperation};
use crate::tree::{Accept, Command, CommandResult, CommandSink, ResultHandler, SignalTree};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Something that runs tasks, now or later.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs every task on the spot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Collects tasks until [`TaskQueue::run_pending`] is called.
///
/// Useful for event-loop integration and for tests that need to observe
/// what is scheduled.
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run queued tasks, including ones queued while running, until the
    /// queue is empty. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.tasks.lock().pop_front();
            let Some(task) = next else { break };
            task();
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl Executor for TaskQueue {
    fn execute(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}

/// Executors supplied by an embedding environment.
#[derive(Clone)]
pub struct ExecutionHooks {
    is_active: Arc<dyn Fn() -> bool + Send + Sync>,
    result_notifier: Option<Arc<dyn Executor>>,
    effect_dispatcher: Option<Arc<dyn Executor>>,
}

impl ExecutionHooks {
    /// Always active hooks that supply nothing yet.
    pub fn new() -> Self {
        Self { is_active: Arc::new(|| true), result_notifier: None, effect_dispatcher: None }
    }

    /// Only consult these hooks while `is_active` returns `true`.
    pub fn with_activity(mut self, is_active: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.is_active = Arc::new(is_active);
        self
    }

    pub fn with_result_notifier(mut self, executor: impl Executor + 'static) -> Self {
        self.result_notifier = Some(Arc::new(executor));
        self
    }

    pub fn with_effect_dispatcher(mut self, executor: impl Executor + 'static) -> Self {
        self.effect_dispatcher = Some(Arc::new(executor));
        self
    }

    fn is_active(&self) -> bool {
        (self.is_active)()
    }
}

impl Default for ExecutionHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHooks")
            .field("result_notifier", &self.result_notifier.is_some())
            .field("effect_dispatcher", &self.effect_dispatcher.is_some())
            .finish()
    }
}

struct RuntimeInner {
    config: SignalConfig,
    hooks: Vec<ExecutionHooks>,
}

/// Entry point for creating trees, effects and transactions.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Builder for [`Runtime`].
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: SignalConfig,
    hooks: Vec<ExecutionHooks>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: SignalConfig) -> Self {
        self.config = config;
        self
    }

    /// Register hooks. Earlier registrations take precedence.
    pub fn hooks(mut self, hooks: ExecutionHooks) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn build(self) -> Runtime {
        Runtime { inner: Arc::new(RuntimeInner { config: self.config, hooks: self.hooks }) }
    }
}

impl Runtime {
    /// A runtime with default configuration and immediate execution.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &SignalConfig {
        &self.inner.config
    }

    pub(crate) fn result_notifier(&self) -> Arc<dyn Executor> {
        self.select(|hooks| hooks.result_notifier.as_ref())
    }

    pub(crate) fn effect_dispatcher(&self) -> Arc<dyn Executor> {
        self.select(|hooks| hooks.effect_dispatcher.as_ref())
    }

    fn select(&self, hook: impl Fn(&ExecutionHooks) -> Option<&Arc<dyn Executor>>) -> Arc<dyn Executor> {
        self.inner
            .hooks
            .iter()
            .filter(|hooks| hooks.is_active())
            .find_map(|hooks| hook(hooks).cloned())
            .unwrap_or_else(|| Arc::new(ImmediateExecutor) as Arc<dyn Executor>)
    }

    // ---- Trees ----

    pub fn local_tree(&self) -> SignalTree {
        SignalTree::local(self)
    }

    pub fn clustered_tree(&self, sink: Arc<dyn CommandSink>) -> SignalTree {
        SignalTree::clustered(self, sink)
    }

    /// Submit a raw command through the current transaction.
    pub fn submit(&self, tree: &SignalTree, command: Command) -> Result<PendingResult<Accept>, SignalError> {
        let (resolver, result) = pending(self);
        let handler: ResultHandler =
            Box::new(move |outcome: &CommandResult| resolver.resolve(outcome.clone().into_result()));
        Transaction::current().include(tree, command, handler)?;
        Ok(result)
    }

    // ---- Transactions ----

    /// Run `body` in a staged transaction.
    ///
    /// Commands issued by `body` are committed together when it returns.
    /// Inside another staged transaction, `body` joins it and the result
    /// resolves with the outer transaction's outcome.
    pub fn run_in_transaction(&self, body: impl FnOnce()) -> PendingResult<()> {
        self.run_in_transaction_with(body).into_parts().1
    }

    /// Like [`Runtime::run_in_transaction`], keeping the body's return value.
    pub fn run_in_transaction_with<R>(&self, body: impl FnOnce() -> R) -> TransactionOperation<R> {
        let (resolver, result) = pending(self);
        let value = Transaction::run_staged(body, Box::new(move |outcome| resolver.resolve(outcome)));
        TransactionOperation::new(value, result)
    }

    // ---- Reactivity ----

    /// Register an effect. It runs once right away.
    pub fn effect(&self, mut action: impl FnMut() + Send + 'static) -> Effect {
        Effect::new(
            self,
            Box::new(move || {
                action();
                Ok(())
            }),
        )
    }

    /// Register an effect whose failures are logged instead of propagated.
    pub fn try_effect<E>(&self, mut action: impl FnMut() -> Result<(), E> + Send + 'static) -> Effect
    where
        E: Into<EffectError>,
    {
        Effect::new(self, Box::new(move || action().map_err(Into::<EffectError>::into)))
    }

    /// Create a lazily computed value.
    pub fn computed<T>(&self, compute: impl Fn() -> T + Send + Sync + 'static) -> Computed<T>
    where
        T: Clone + Send + 'static,
    {
        Computed::new(Box::new(compute))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("hooks", &self.inner.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Id;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    #[derive(Clone, Default)]
    struct Counting {
        count: Arc<AtomicI32>,
    }

    impl Executor for Counting {
        fn execute(&self, task: Task) {
            self.count.fetch_add(1, Ordering::SeqCst);
            task();
        }
    }

    #[test]
    fn first_active_hook_wins() {
        let inactive = Counting::default();
        let active = Counting::default();
        let late = Counting::default();
        let runtime = Runtime::builder()
            .hooks(ExecutionHooks::new().with_activity(|| false).with_result_notifier(inactive.clone()))
            .hooks(ExecutionHooks::new().with_result_notifier(active.clone()))
            .hooks(ExecutionHooks::new().with_result_notifier(late.clone()))
            .build();

        runtime.result_notifier().execute(Box::new(|| {}));

        assert_eq!(inactive.count.load(Ordering::SeqCst), 0);
        assert_eq!(active.count.load(Ordering::SeqCst), 1);
        assert_eq!(late.count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hooks_without_executor_fall_through() {
        let dispatcher = Counting::default();
        let runtime = Runtime::builder()
            .hooks(ExecutionHooks::new().with_result_notifier(ImmediateExecutor))
            .hooks(ExecutionHooks::new().with_effect_dispatcher(dispatcher.clone()))
            .build();

        runtime.effect_dispatcher().execute(Box::new(|| {}));

        assert_eq!(dispatcher.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_execution_is_immediate() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        Runtime::new().effect_dispatcher().execute(Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn task_queue_runs_tasks_queued_while_running() {
        let queue = TaskQueue::new();
        let count = Arc::new(AtomicI32::new(0));

        let inner_queue = queue.clone();
        let inner_count = count.clone();
        queue.execute(Box::new(move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let again = inner_count.clone();
            inner_queue.execute(Box::new(move || {
                again.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn submit_resolves_with_accept() {
        let runtime = Runtime::new();
        let tree = runtime.local_tree();

        let mut result = runtime.submit(&tree, Command::set(Id::ZERO, Some(json!(1)))).unwrap();

        let accept = result.result().cloned().unwrap().unwrap();
        assert!(accept.modification(Id::ZERO).is_some());
    }

    #[test]
    fn transaction_returns_body_value() {
        let runtime = Runtime::new();
        let root = runtime.local_tree().root();

        let operation = runtime.run_in_transaction_with(|| {
            root.set(json!("inside")).unwrap();
            42
        });
        let (value, mut result) = operation.into_parts();

        assert_eq!(value, 42);
        assert_eq!(result.result(), Some(&Ok(())));
        assert_eq!(root.value_json(), Some(json!("inside")));
    }
}
