//! One-directional propagation of [`FilterState`] from the table to dependent views.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::trace;

use crate::filter_state::FilterState;

type FilterHandler = Arc<dyn Fn(&FilterState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BusInner {
    next_id: u64,
    latest: FilterState,
    subscribers: Vec<(SubscriptionId, FilterHandler)>,
}

/// Publish/subscribe channel for filter snapshots.
///
/// `publish` runs every handler before returning, so a publisher that publishes before
/// issuing its own query knows every subscriber has already seen the new filters.
#[derive(Default)]
pub struct SyncBus {
    inner: Mutex<BusInner>,
}

impl SyncBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handler`. Delivery stops when the returned guard is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&FilterState) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.subscribers.push((id, Arc::new(handler)));
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(existing, _)| *existing != id);
        inner.subscribers.len() != before
    }

    /// Stores `filters` as the latest snapshot and hands it to every subscriber.
    /// Returns the number of handlers invoked.
    pub fn publish(&self, filters: FilterState) -> usize {
        let handlers: Vec<FilterHandler> = {
            let mut inner = self.lock();
            inner.latest = filters.clone();
            inner
                .subscribers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        // Handlers run outside the lock so they may subscribe or read `latest`.
        for handler in &handlers {
            handler(&filters);
        }
        trace!(
            subscribers = handlers.len(),
            filters = filters.len(),
            "published filter state"
        );
        handlers.len()
    }

    pub fn latest(&self) -> FilterState {
        self.lock().latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Guard for a bus registration; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriptionId,
    bus: Weak<SyncBus>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_bus_tests.rs"]
mod tests;
