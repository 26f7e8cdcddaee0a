//! In-process event bus with ordered, isolated fan-out.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{
    Delivery, DropReason, EventFilter, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SyncEvent,
};

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// How a subscriber is reached.
#[derive(Clone)]
enum Sink {
    /// Called synchronously on the publishing task.
    Handler(Handler),
    /// Bounded channel; dropped when full.
    Channel(Sender<Delivery>),
}

/// Internal subscription state.
#[derive(Clone)]
struct Subscriber {
    filter: EventFilter,
    sink: Sink,
}

impl Subscriber {
    /// Deliver an event. Returns false if the subscriber must be dropped.
    fn deliver(&self, id: SubscriptionId, event: &SyncEvent) -> bool {
        match self.sink {
            Sink::Handler(ref handler) => {
                let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
                if result.is_err() {
                    warn!(
                        subscription = id.0,
                        kind = %event.kind,
                        "event handler panicked; continuing fan-out"
                    );
                }
                true
            }
            Sink::Channel(ref sender) => sender.try_send(Delivery::Event(event.clone())).is_ok(),
        }
    }
}

/// Publish/subscribe relay between event sources and consumers.
///
/// Subscribers are notified in registration order. The subscriber table is
/// snapshotted before dispatch, so handlers may publish or (un)subscribe
/// without deadlocking; such changes take effect from the next publish.
pub struct EventBus {
    /// Active subscribers, ordered by id (= registration order).
    subscribers: RwLock<BTreeMap<SubscriptionId, Subscriber>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Events published so far.
    published: AtomicU64,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
        }
    }

    /// Register a synchronous handler for events matching `filter`.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let subscriber = Subscriber {
            filter,
            sink: Sink::Handler(Arc::new(handler)),
        };
        self.subscribers.write().insert(id, subscriber);
        id
    }

    /// Register a channel subscription.
    pub fn subscribe_channel(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = self.allocate_id();
        let (sender, receiver) = bounded(config.buffer_size.max(1));
        let subscriber = Subscriber {
            filter: config.filter,
            sink: Sink::Channel(sender),
        };
        self.subscribers.write().insert(id, subscriber);
        SubscriptionHandle { id, receiver }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self.subscribers.write().remove(&id);
        if let Some(Subscriber {
            sink: Sink::Channel(sender),
            ..
        }) = removed
        {
            let _ = sender.try_send(Delivery::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    /// Get subscriber count.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Number of events published since creation.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Deliver `event` to every matching subscriber, in registration order.
    pub fn publish(&self, event: SyncEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let snapshot: Vec<(SubscriptionId, Subscriber)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, sub)| (*id, sub.clone()))
            .collect();

        debug!(kind = %event.kind, source = ?event.source, subscribers = snapshot.len(), "publish");

        let mut to_remove = Vec::new();
        for (id, sub) in &snapshot {
            if sub.filter.matches(&event) && !sub.deliver(*id, &event) {
                to_remove.push(*id);
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscribers.write();
            for id in to_remove {
                if let Some(Subscriber {
                    sink: Sink::Channel(sender),
                    ..
                }) = subs.remove(&id)
                {
                    warn!(subscription = id.0, "dropping slow event subscriber");
                    let _ = sender.try_send(Delivery::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }

    /// Drop every subscriber.
    pub fn close(&self) {
        let subs = std::mem::take(&mut *self.subscribers.write());
        for (_, sub) in subs {
            if let Sink::Channel(sender) = sub.sink {
                let _ = sender.try_send(Delivery::Dropped {
                    reason: DropReason::Closed,
                });
            }
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
