//! Canopy Core
//!
//! This crate implements a transactional, reactive tree of signals: one
//! in-memory structure holding a hierarchy of JSON values, changed only by
//! structured commands and observed by computations that re-run when what
//! they read changes.
//!
//! It provides:
//!
//! - Immutable tree revisions and a pure command algebra over them
//! - Signal trees that install revisions and notify observers, locally or
//!   with confirmation by a cluster
//! - Immediate and staged transactions with optimistic read conditions
//! - Effects and computed values with fine-grained dependency tracking
//!
//! # Architecture
//!
//! - `tree`: identifiers, nodes, revisions, commands and the tree container
//! - `transaction`: the per-thread transaction stack and operation results
//! - `reactive`: node signals, usage tracking, effects and the runtime
//! - `codec`: conversion between application values and stored JSON
//! - `config`: runtime tunables
//!
//! # Example
//!
//! ```rust,ignore
//! use canopy_core::reactive::Runtime;
//! use canopy_core::tree::ListPosition;
//!
//! let runtime = Runtime::new();
//! let root = runtime.local_tree().root();
//!
//! let todos = root.put_child_if_absent("todos", ())?.signal;
//! let watcher = todos.clone();
//! let effect = runtime.effect(move || {
//!     println!("{} todos", watcher.list_children().len());
//! });
//!
//! runtime.run_in_transaction(|| {
//!     todos.insert_child("write docs", ListPosition::last()).ok();
//!     todos.insert_child("ship it", ListPosition::last()).ok();
//! });
//! // The effect ran once more, printing "2 todos".
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod reactive;
pub mod transaction;
pub mod tree;

pub use config::SignalConfig;
pub use error::{OperationError, SignalError, TreeError};
pub use reactive::{Computed, Effect, NodeSignal, Runtime};
pub use transaction::{PendingResult, Transaction};
pub use tree::{Command, CommandResult, Id, ListPosition, SignalTree, TreeRevision};
