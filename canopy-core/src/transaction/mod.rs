//! Transactions
//!
//! Every read and write of a signal goes through the transaction that is
//! active on the calling thread.
//!
//! # How Transactions Work
//!
//! 1. Without anything active, the **immediate** transaction applies: reads
//!    see the tree's current revision and each command is committed as soon
//!    as it is submitted.
//!
//! 2. [`Runtime::run_in_transaction`](crate::reactive::Runtime::run_in_transaction)
//!    pushes a **staged** transaction. Reads see a per-tree view and register
//!    optimistic read conditions. Commands are buffered and committed
//!    together when the outermost body returns. A staged transaction started
//!    while another one is active joins it.
//!
//! 3. [`Transaction::run_write_through`] applies each command at once, even
//!    inside a staged transaction. The staged view is updated to match.
//!
//! 4. [`Transaction::run_without_transaction`] forces the immediate
//!    transaction. Change observers always run this way.

mod operation;
mod staged;

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{OperationError, SignalError};
use crate::tree::{Command, Id, ResultHandler, SignalTree, TreeRevision};

pub use operation::{PendingResult, TransactionOperation};
pub(crate) use operation::{pending, Resolver};

use staged::StagedTransaction;

/// Called once with the outcome of a staged commit.
pub(crate) type Completion = Box<dyn FnOnce(Result<(), OperationError>) + Send>;

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

#[derive(Clone)]
enum Frame {
    Immediate,
    Staged(Rc<StagedTransaction>),
    WriteThrough(Option<Rc<StagedTransaction>>),
}

/// Pops the frame it pushed when dropped, also on unwind.
struct FrameGuard {
    depth: usize,
}

impl FrameGuard {
    fn push(frame: Frame) -> Self {
        let depth = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            frames.push(frame);
            frames.len()
        });
        Self { depth }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            debug_assert_eq!(frames.len(), self.depth, "transaction frames popped out of order");
            frames.pop();
        });
    }
}

/// The transaction active on the current thread.
#[derive(Clone)]
pub struct Transaction {
    frame: Frame,
}

impl Transaction {
    pub fn current() -> Self {
        let frame = FRAMES.with(|frames| frames.borrow().last().cloned()).unwrap_or(Frame::Immediate);
        Self { frame }
    }

    /// Whether commands are buffered until the enclosing body returns.
    pub fn is_staged(&self) -> bool {
        matches!(self.frame, Frame::Staged(_))
    }

    /// The revision of `tree` as seen from this transaction.
    pub fn read(&self, tree: &SignalTree) -> TreeRevision {
        match &self.frame {
            Frame::Staged(staged) | Frame::WriteThrough(Some(staged)) => staged.view(tree),
            Frame::Immediate | Frame::WriteThrough(None) => tree.read(),
        }
    }

    /// Record that the caller's outcome depends on the current state of `id`.
    pub fn register_read(&self, tree: &SignalTree, id: Id) {
        if let Frame::Staged(staged) = &self.frame {
            staged.register_read(tree, id);
        }
    }

    pub(crate) fn include(
        &self,
        tree: &SignalTree,
        command: Command,
        handler: ResultHandler,
    ) -> Result<(), SignalError> {
        match &self.frame {
            Frame::Staged(staged) => staged.include(tree, command, handler),
            Frame::WriteThrough(staged) => {
                let result = tree.commit(command.clone(), Some(handler));
                if let (Some(staged), true) = (staged, result.is_accepted()) {
                    staged.fold(tree, &command);
                }
                Ok(())
            }
            Frame::Immediate => {
                tree.commit(command, Some(handler));
                Ok(())
            }
        }
    }

    /// Run `f` with every command applied as soon as it is submitted.
    pub fn run_write_through<R>(f: impl FnOnce() -> R) -> R {
        let staged = match Self::current().frame {
            Frame::Staged(staged) | Frame::WriteThrough(Some(staged)) => Some(staged),
            Frame::Immediate | Frame::WriteThrough(None) => None,
        };
        let _guard = FrameGuard::push(Frame::WriteThrough(staged));
        f()
    }

    /// Run `f` outside of any staged transaction.
    pub fn run_without_transaction<R>(f: impl FnOnce() -> R) -> R {
        let _guard = FrameGuard::push(Frame::Immediate);
        f()
    }

    /// Run `body` in a staged transaction and report the commit outcome.
    ///
    /// When a staged transaction is already active, `body` joins it and
    /// `done` fires when that transaction commits.
    pub(crate) fn run_staged<R>(body: impl FnOnce() -> R, done: Completion) -> R {
        if let Frame::Staged(active) = Self::current().frame {
            active.add_completion(done);
            return body();
        }

        let staged = Rc::new(StagedTransaction::new(done));
        let value = {
            let _guard = FrameGuard::push(Frame::Staged(Rc::clone(&staged)));
            body()
        };
        staged.commit();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Runtime;
    use crate::tree::ListPosition;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, ResultHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let clone = seen.clone();
        (seen, Box::new(move |result| clone.lock().push(result.is_accepted())))
    }

    fn outcome() -> (Arc<Mutex<Option<Result<(), OperationError>>>>, Completion) {
        let slot = Arc::new(Mutex::new(None));
        let clone = slot.clone();
        (slot, Box::new(move |result| *clone.lock() = Some(result)))
    }

    #[test]
    fn immediate_transaction_commits_at_once() {
        let tree = Runtime::new().local_tree();
        let (seen, handler) = recorder();

        assert!(!Transaction::current().is_staged());
        Transaction::current()
            .include(&tree, Command::set(Id::ZERO, Some(json!(1))), handler)
            .unwrap();

        assert_eq!(*seen.lock(), vec![true]);
        assert_eq!(tree.read().data(Id::ZERO).and_then(|d| d.value()), Some(&json!(1)));
    }

    #[test]
    fn staged_transaction_buffers_until_body_returns() {
        let tree = Runtime::new().local_tree();
        let (seen, handler) = recorder();
        let (result, done) = outcome();

        Transaction::run_staged(
            || {
                let tx = Transaction::current();
                assert!(tx.is_staged());
                tx.include(&tree, Command::set(Id::ZERO, Some(json!("staged"))), handler).unwrap();

                assert_eq!(tx.read(&tree).data(Id::ZERO).and_then(|d| d.value()), Some(&json!("staged")));
                assert_eq!(tree.read().data(Id::ZERO).and_then(|d| d.value()), None);
            },
            done,
        );

        assert_eq!(*seen.lock(), vec![true]);
        assert_eq!(*result.lock(), Some(Ok(())));
        assert_eq!(tree.read().data(Id::ZERO).and_then(|d| d.value()), Some(&json!("staged")));
    }

    #[test]
    fn nested_staged_transaction_joins_outer() {
        let tree = Runtime::new().local_tree();
        let (outer, outer_done) = outcome();
        let (inner, inner_done) = outcome();

        Transaction::run_staged(
            || {
                Transaction::run_staged(
                    || {
                        let (_, handler) = recorder();
                        Transaction::current()
                            .include(&tree, Command::set(Id::ZERO, Some(json!(1))), handler)
                            .unwrap();
                    },
                    inner_done,
                );
                assert!(inner.lock().is_none());
            },
            outer_done,
        );

        assert_eq!(*inner.lock(), Some(Ok(())));
        assert_eq!(*outer.lock(), Some(Ok(())));
    }

    #[test]
    fn locally_rejected_command_fails_whole_transaction() {
        let tree = Runtime::new().local_tree();
        let (seen, first) = recorder();
        let (_, second) = recorder();
        let (result, done) = outcome();

        Transaction::run_staged(
            || {
                let tx = Transaction::current();
                tx.include(&tree, Command::set(Id::ZERO, Some(json!(1))), first).unwrap();
                tx.include(&tree, Command::set(Id::random(), Some(json!(2))), second).unwrap();
            },
            done,
        );

        assert_eq!(*seen.lock(), vec![false]);
        assert!(matches!(*result.lock(), Some(Err(OperationError::Rejected(_)))));
        assert_eq!(tree.read().data(Id::ZERO).and_then(|d| d.value()), None);
    }

    #[test]
    fn concurrent_change_to_read_node_rejects_commit() {
        let tree = Runtime::new().local_tree();
        let (result, done) = outcome();

        Transaction::run_staged(
            || {
                let tx = Transaction::current();
                tx.register_read(&tree, Id::ZERO);
                Transaction::run_without_transaction(|| {
                    tree.apply_locally(Command::set(Id::ZERO, Some(json!("other"))));
                });
                let (_, handler) = recorder();
                tx.include(&tree, Command::insert(Id::ZERO, None, ListPosition::last()), handler)
                    .unwrap();
            },
            done,
        );

        assert_eq!(*result.lock(), Some(Err(OperationError::Rejected("Unexpected last update".into()))));
        assert!(tree.read().data(Id::ZERO).map_or(true, |d| d.list_children().is_empty()));
    }

    #[test]
    fn clustered_tree_cannot_share_a_transaction() {
        let runtime = Runtime::new();
        let local = runtime.local_tree();
        let clustered = runtime.clustered_tree(Arc::new(|_: &SignalTree, _: Vec<Command>| {}));
        let (_, done) = outcome();

        Transaction::run_staged(
            || {
                let tx = Transaction::current();
                let (_, first) = recorder();
                let (_, second) = recorder();
                tx.include(&local, Command::set(Id::ZERO, None), first).unwrap();
                let err = tx.include(&clustered, Command::set(Id::ZERO, None), second);
                assert!(matches!(err, Err(SignalError::MixedTrees)));
            },
            done,
        );
    }

    #[test]
    fn write_through_updates_staged_view() {
        let tree = Runtime::new().local_tree();
        let (_, done) = outcome();

        Transaction::run_staged(
            || {
                Transaction::run_write_through(|| {
                    let (_, handler) = recorder();
                    Transaction::current()
                        .include(&tree, Command::set(Id::ZERO, Some(json!("now"))), handler)
                        .unwrap();
                });
                assert_eq!(tree.read().data(Id::ZERO).and_then(|d| d.value()), Some(&json!("now")));
                let view = Transaction::current().read(&tree);
                assert_eq!(view.data(Id::ZERO).and_then(|d| d.value()), Some(&json!("now")));
            },
            done,
        );
    }

    #[test]
    fn multi_tree_commit_is_all_or_nothing() {
        let runtime = Runtime::new();
        let a = runtime.local_tree();
        let b = runtime.local_tree();
        let (result, done) = outcome();

        Transaction::run_staged(
            || {
                let tx = Transaction::current();
                let (_, first) = recorder();
                let (_, second) = recorder();
                tx.include(&a, Command::set(Id::ZERO, Some(json!("a"))), first).unwrap();
                tx.register_read(&b, Id::ZERO);
                tx.include(&b, Command::set(Id::ZERO, Some(json!("b"))), second).unwrap();
                Transaction::run_without_transaction(|| {
                    b.apply_locally(Command::set(Id::ZERO, Some(json!("concurrent"))));
                });
            },
            done,
        );

        assert!(matches!(*result.lock(), Some(Err(OperationError::Rejected(_)))));
        assert_eq!(a.read().data(Id::ZERO).and_then(|d| d.value()), None);
        assert_eq!(b.read().data(Id::ZERO).and_then(|d| d.value()), Some(&json!("concurrent")));
    }
}
