//! Effect Implementation
//!
//! An Effect is an action that re-runs whenever tree state it read changes.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its action immediately inside a tracking
//!    frame, outside of any transaction.
//!
//! 2. After each run it asks every recorded usage for its next change. The
//!    listener is shared and fires at most once per run.
//!
//! 3. On a change, all subscriptions of that run are cancelled and one
//!    re-run is handed to the runtime's effect dispatcher. More changes
//!    before the dispatcher gets to it are coalesced into that one re-run.
//!
//! 4. The re-run records a fresh set of usages, since different runs may
//!    read different nodes.
//!
//! # Failures
//!
//! An action returning `Err` is logged and the effect stays active. A
//! panicking action, or one that writes a node it depends on, disposes the
//! effect.

use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::context::{Usages, UsageTracker};
use super::runtime::Runtime;
use super::subscriber::{SubscriberId, Subscription};
use super::usage::ChangeListener;
use crate::transaction::Transaction;

/// Error type of fallible effect actions.
pub type EffectError = Box<dyn Error + Send + Sync>;

type Action = Box<dyn FnMut() -> Result<(), EffectError> + Send>;

/// Counter for generating unique effect IDs.
static EFFECT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

struct EffectInner {
    id: u64,
    subscriber: SubscriberId,
    runtime: Runtime,
    action: Mutex<Action>,
    subscription: Mutex<Option<Subscription>>,
    /// Bumped on every run; listeners of older runs are ignored.
    generation: AtomicU64,
    scheduled: AtomicBool,
    disposed: AtomicBool,
    run_count: AtomicUsize,
}

/// A registered reactive action.
///
/// Clones refer to the same effect. Dropping every handle does not stop the
/// effect; call [`Effect::dispose`].
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    pub(crate) fn new(runtime: &Runtime, action: Action) -> Self {
        let inner = Arc::new(EffectInner {
            id: EFFECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            subscriber: SubscriberId::new(),
            runtime: runtime.clone(),
            action: Mutex::new(action),
            subscription: Mutex::new(None),
            generation: AtomicU64::new(0),
            scheduled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
        });
        debug!(effect = inner.id, "registered effect");
        inner.run();
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Stop the effect and release its subscriptions.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// How many times the action has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl EffectInner {
    fn run(self: &Arc<Self>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.scheduled.store(false, Ordering::SeqCst);

        let Some(mut guard) = self.action.try_lock() else {
            warn!(effect = self.id, "effect triggered itself while running; skipping re-run");
            return;
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let weak: Weak<EffectInner> = Arc::downgrade(self);
        let on_loop: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(effect) = weak.upgrade() {
                error!(effect = effect.id, "effect wrote a node it depends on; disposing");
                effect.dispose();
            }
        });

        let action = &mut **guard;
        let (outcome, usages) = Transaction::run_without_transaction(|| {
            UsageTracker::track_effect(self.subscriber, on_loop, || {
                panic::catch_unwind(AssertUnwindSafe(|| action()))
            })
        });
        drop(guard);
        self.run_count.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(effect = self.id, error = %err, "effect action failed"),
            Err(_) => {
                error!(effect = self.id, "effect action panicked; disposing");
                self.dispose();
            }
        }

        if !self.disposed.load(Ordering::SeqCst) {
            self.subscribe(usages, generation);
        }
    }

    fn subscribe(self: &Arc<Self>, usages: Usages, generation: u64) {
        let weak = Arc::downgrade(self);
        let listener: ChangeListener = Arc::new(move || {
            if let Some(effect) = weak.upgrade() {
                effect.on_change(generation);
            }
            false
        });

        let subscriptions: Vec<Subscription> =
            usages.iter().map(|usage| usage.on_next_change(Arc::clone(&listener))).collect();
        let combined = Subscription::combine(subscriptions);

        let mut slot = self.subscription.lock();
        // A usage that had already changed may have scheduled a newer run.
        let stale = self.generation.load(Ordering::SeqCst) != generation
            || self.scheduled.load(Ordering::SeqCst)
            || self.disposed.load(Ordering::SeqCst);
        if stale {
            drop(slot);
            combined.cancel();
            return;
        }
        *slot = Some(combined);
    }

    fn on_change(self: &Arc<Self>, generation: u64) {
        if self.disposed.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }

        trace!(effect = self.id, "scheduling effect re-run");
        let effect = Arc::clone(self);
        self.runtime.effect_dispatcher().execute(Box::new(move || effect.run()));
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        debug!(effect = self.id, "disposed effect");
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
