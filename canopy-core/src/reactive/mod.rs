//! Reactive Primitives
//!
//! This module connects the signal tree to computations that depend on it:
//! node signals, effects and computed values.
//!
//! # Concepts
//!
//! ## Node Signals
//!
//! A [`NodeSignal`] is a handle onto one node. Reading it inside a tracking
//! frame (an effect or computed value) records a [`Usage`]: a fingerprint of
//! the part of the node that was read. Writing it submits a command through
//! the current transaction.
//!
//! ## Effects
//!
//! An [`Effect`] runs an action and re-runs it whenever one of its recorded
//! usages changes. Changes to parts of a node the action never read do not
//! trigger it.
//!
//! ## Computed Values
//!
//! A [`Computed`] caches a derived value together with its usages and only
//! recomputes when one of them has changed.
//!
//! # Implementation Notes
//!
//! Tracking uses a thread-local frame stack. Waiting for a change uses the
//! tree's one-shot observers, and the "has it changed already, otherwise
//! subscribe" step runs under the tree lock so no change slips in between.

mod computed;
mod context;
mod effect;
mod runtime;
mod signal;
mod subscriber;
mod usage;

pub use computed::Computed;
pub use context::{UsageTracker, Usages};
pub use effect::{Effect, EffectError};
pub use runtime::{ExecutionHooks, Executor, ImmediateExecutor, Runtime, RuntimeBuilder, Task, TaskQueue};
pub use signal::{InsertOperation, NodeSignal, UpdateOperation, Validators};
pub use subscriber::{SubscriberId, Subscription};
pub use usage::{Aspect, ChangeListener, NodeUsage, Usage};
