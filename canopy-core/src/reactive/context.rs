//! Usage Tracking
//!
//! The usage tracker records which parts of the tree a computation read, so
//! that it can be re-run when exactly those parts change.
//!
//! # Implementation
//!
//! A thread-local stack holds one frame per running computation. Reading a
//! signal registers a [`Usage`] with the top frame. Frames pushed by
//! [`UsageTracker::untracked`] record nothing.
//!
//! Effect frames also carry a loop handler. Writing a node that any effect
//! frame on the stack has read is an effect loop: the handler disposes the
//! effect and the write fails.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use smallvec::SmallVec;

use super::usage::Usage;
use super::SubscriberId;
use crate::error::SignalError;
use crate::tree::{Id, SignalTree};

/// The usages recorded by one tracked run.
pub type Usages = SmallVec<[Arc<dyn Usage>; 4]>;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

struct Frame {
    subscriber: Option<SubscriberId>,
    /// `None` while tracking is suspended.
    usages: Option<Usages>,
    on_loop: Option<Rc<dyn Fn()>>,
}

/// Guard that pops its frame when dropped, also on unwind.
struct TrackingScope {
    subscriber: Option<SubscriberId>,
}

impl TrackingScope {
    fn enter(frame: Frame) -> Self {
        let subscriber = frame.subscriber;
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(frame));
        Self { subscriber }
    }

    fn take_usages(&self) -> Usages {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow_mut()
                .last_mut()
                .and_then(|frame| frame.usages.take())
                .unwrap_or_default()
        })
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(frame) = popped {
                debug_assert_eq!(
                    frame.subscriber, self.subscriber,
                    "tracking frame mismatch: expected {:?}, got {:?}",
                    self.subscriber, frame.subscriber
                );
            }
        });
    }
}

/// Entry points of the thread-local usage tracker.
pub struct UsageTracker;

impl UsageTracker {
    /// Run `f` and collect the usages it registers.
    pub fn track<R>(subscriber: SubscriberId, f: impl FnOnce() -> R) -> (R, Usages) {
        Self::run(Frame { subscriber: Some(subscriber), usages: Some(Usages::new()), on_loop: None }, f)
    }

    /// Like [`UsageTracker::track`], for an effect that `on_loop` disposes.
    pub(crate) fn track_effect<R>(
        subscriber: SubscriberId,
        on_loop: Rc<dyn Fn()>,
        f: impl FnOnce() -> R,
    ) -> (R, Usages) {
        Self::run(
            Frame { subscriber: Some(subscriber), usages: Some(Usages::new()), on_loop: Some(on_loop) },
            f,
        )
    }

    fn run<R>(frame: Frame, f: impl FnOnce() -> R) -> (R, Usages) {
        let scope = TrackingScope::enter(frame);
        let value = f();
        let usages = scope.take_usages();
        (value, usages)
    }

    /// Run `f` without recording any usage.
    pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
        let _scope = TrackingScope::enter(Frame { subscriber: None, usages: None, on_loop: None });
        f()
    }

    /// Whether a read right now would be recorded.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| stack.borrow().last().is_some_and(|frame| frame.usages.is_some()))
    }

    /// Record a usage in the innermost frame.
    pub fn register(usage: Arc<dyn Usage>) {
        CONTEXT_STACK.with(|stack| {
            if let Some(usages) = stack.borrow_mut().last_mut().and_then(|frame| frame.usages.as_mut()) {
                usages.push(usage);
            }
        });
    }

    /// Fail if a running effect has read the node about to be written.
    pub(crate) fn check_write(tree: &SignalTree, id: Id) -> Result<(), SignalError> {
        let looping: Vec<Rc<dyn Fn()>> = CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .filter_map(|frame| {
                    let on_loop = frame.on_loop.as_ref()?;
                    let usages = frame.usages.as_ref()?;
                    usages.iter().any(|usage| usage.covers(tree.id(), id)).then(|| Rc::clone(on_loop))
                })
                .collect()
        });
        if looping.is_empty() {
            return Ok(());
        }
        for on_loop in looping {
            on_loop();
        }
        Err(SignalError::EffectLoop(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::usage::ChangeListener;
    use crate::reactive::{Runtime, Subscription};
    use std::cell::Cell;

    struct FakeUsage {
        tree: u64,
        id: Id,
    }

    impl Usage for FakeUsage {
        fn has_changes(&self) -> bool {
            false
        }

        fn on_next_change(&self, _listener: ChangeListener) -> Subscription {
            Subscription::empty()
        }

        fn covers(&self, tree: u64, id: Id) -> bool {
            self.tree == tree && self.id == id
        }
    }

    #[test]
    fn track_collects_registered_usages() {
        assert!(!UsageTracker::is_active());

        let ((), usages) = UsageTracker::track(SubscriberId::new(), || {
            assert!(UsageTracker::is_active());
            UsageTracker::register(Arc::new(FakeUsage { tree: 0, id: Id::ZERO }));
            UsageTracker::register(Arc::new(FakeUsage { tree: 0, id: Id::EDGE }));
        });

        assert_eq!(usages.len(), 2);
        assert!(!UsageTracker::is_active());
    }

    #[test]
    fn untracked_reads_are_not_recorded() {
        let ((), usages) = UsageTracker::track(SubscriberId::new(), || {
            UsageTracker::untracked(|| {
                assert!(!UsageTracker::is_active());
                UsageTracker::register(Arc::new(FakeUsage { tree: 0, id: Id::ZERO }));
            });
        });

        assert!(usages.is_empty());
    }

    #[test]
    fn nested_frames_collect_separately() {
        let ((inner, ()), outer) = UsageTracker::track(SubscriberId::new(), || {
            let nested = UsageTracker::track(SubscriberId::new(), || {
                UsageTracker::register(Arc::new(FakeUsage { tree: 0, id: Id::ZERO }));
            });
            (nested.1, ())
        });

        assert_eq!(inner.len(), 1);
        assert!(outer.is_empty());
    }

    #[test]
    fn writing_a_read_node_from_an_effect_is_a_loop() {
        let tree = Runtime::new().local_tree();
        let looped = Rc::new(Cell::new(false));
        let flag = looped.clone();

        let (result, _) = UsageTracker::track_effect(SubscriberId::new(), Rc::new(move || flag.set(true)), || {
            UsageTracker::register(Arc::new(FakeUsage { tree: tree.id(), id: Id::ZERO }));
            UsageTracker::check_write(&tree, Id::ZERO)
        });

        assert!(matches!(result, Err(SignalError::EffectLoop(id)) if id == Id::ZERO));
        assert!(looped.get());
        assert!(UsageTracker::check_write(&tree, Id::ZERO).is_ok());
    }
}
