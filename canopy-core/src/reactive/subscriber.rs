//! Subscriber identity and subscriptions.
//!
//! Effects and computed values are subscribers. Each one owns a
//! [`SubscriberId`] that marks the tracking frames it pushes, and holds
//! [`Subscription`]s for the node changes it waits on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for undoing a registration.
///
/// Dropping a subscription does not cancel it; call [`Subscription::cancel`].
#[must_use = "dropping a subscription leaves it registered"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// A subscription with nothing to cancel.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// One subscription that cancels all of `subscriptions`.
    pub fn combine(subscriptions: Vec<Subscription>) -> Self {
        if subscriptions.is_empty() {
            return Self::empty();
        }
        Self::new(move || {
            for subscription in subscriptions {
                subscription.cancel();
            }
        })
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn combined_subscription_cancels_every_part() {
        let cancelled = Arc::new(AtomicI32::new(0));
        let parts = (0..3)
            .map(|_| {
                let cancelled = cancelled.clone();
                Subscription::new(move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        Subscription::combine(parts).cancel();

        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dropping_does_not_cancel() {
        let cancelled = Arc::new(AtomicI32::new(0));
        let clone = cancelled.clone();

        drop(Subscription::new(move || {
            clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }
}
