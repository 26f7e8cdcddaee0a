//! Event bus for normalized sync events.
//!
//! Three sources feed the bus:
//! - Push messages from the duplex connection
//! - Completions of mutations issued by this client
//! - Named signals raised by other views
//!
//! All of them become a [`SyncEvent`], so downstream consumers (the
//! invalidation router first among them) see one input shape.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//!
//! let id = bus.subscribe(EventFilter::kinds(vec![EventKind::BalanceUpdated]), |event| {
//!     println!("balance changed for {:?}", event.user_id);
//! });
//!
//! bus.publish(SyncEvent::signal("balance-updated"));
//! bus.unsubscribe(id);
//! ```

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{
    Delivery, DropReason, EventFilter, EventKind, EventSource, SubscriptionConfig,
    SubscriptionHandle, SubscriptionId, SyncEvent,
};
