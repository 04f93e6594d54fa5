//! Computed Values
//!
//! A Computed is a cached derived value that re-evaluates only when tree
//! state it read has changed.
//!
//! # How Computed Values Work
//!
//! 1. On first access, the computation runs inside a tracking frame and the
//!    result is cached together with the recorded usages.
//!
//! 2. On later accesses every cached usage is asked whether it has changed.
//!    If none has, the cached value is returned.
//!
//! 3. Otherwise the computation runs again and records fresh usages.
//!
//! In both cases the usages are registered with the enclosing tracker, so an
//! effect reading a computed value re-runs when the computed inputs change.
//!
//! Nothing is recomputed eagerly: a computed value that is never read again
//! costs nothing after its inputs change.
//!
//! # Thread Safety
//!
//! The cache is behind a mutex that is never held while a tree lock is
//! taken: usages are checked and the computation runs with it released.
//! Two threads racing on a stale cache may both recompute.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::context::{Usages, UsageTracker};
use super::subscriber::SubscriberId;

type Compute<T> = Box<dyn Fn() -> T + Send + Sync>;

struct Cached<T> {
    value: T,
    usages: Usages,
}

struct ComputedInner<T> {
    subscriber: SubscriberId,
    compute: Compute<T>,
    cache: Mutex<Option<Cached<T>>>,
    compute_count: AtomicUsize,
}

/// A lazily memoized value derived from tree state.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let root = runtime.local_tree().root();
///
/// let reader = root.clone();
/// let doubled = runtime.computed(move || reader.value::<i64>().unwrap_or(0) * 2);
///
/// root.set(21)?;
/// assert_eq!(doubled.get(), 42);
/// ```
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send + 'static> Computed<T> {
    pub(crate) fn new(compute: Compute<T>) -> Self {
        Self {
            inner: Arc::new(ComputedInner {
                subscriber: SubscriberId::new(),
                compute,
                cache: Mutex::new(None),
                compute_count: AtomicUsize::new(0),
            }),
        }
    }

    /// The current value, recomputed only if an input changed.
    pub fn get(&self) -> T {
        // Checking usages takes tree locks, so it happens with the cache released.
        let cached = {
            let cache = self.inner.cache.lock();
            cache.as_ref().map(|cached| (cached.value.clone(), cached.usages.clone()))
        };
        if let Some((value, usages)) = cached {
            if !usages.iter().any(|usage| usage.has_changes()) {
                Self::forward(&usages);
                return value;
            }
        }

        let (value, usages) = UsageTracker::track(self.inner.subscriber, || (self.inner.compute)());
        self.inner.compute_count.fetch_add(1, Ordering::SeqCst);
        Self::forward(&usages);
        *self.inner.cache.lock() = Some(Cached { value: value.clone(), usages });
        value
    }

    /// Whether a value is cached, stale or not.
    pub fn has_value(&self) -> bool {
        self.inner.cache.lock().is_some()
    }

    /// How many times the computation has run.
    pub fn compute_count(&self) -> usize {
        self.inner.compute_count.load(Ordering::SeqCst)
    }

    fn forward(usages: &Usages) {
        if UsageTracker::is_active() {
            for usage in usages {
                UsageTracker::register(Arc::clone(usage));
            }
        }
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("compute_count", &self.inner.compute_count.load(Ordering::SeqCst))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
