//! Event vocabulary and subscription types for the event bus.

use crate::types::{CacheKey, UserId};
use std::fmt;
use std::sync::Arc;

/// Normalized kind of a [`SyncEvent`].
///
/// Push messages, local mutation completions and local signals all map onto
/// this one vocabulary so the invalidation router sees a single input shape.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    TransactionCreated,
    TransactionUpdated,
    TransactionStatusChanged,
    TransactionValidated,
    TransactionDeleted,
    TransactionDeletedByUser,
    TransactionDeletedByAdmin,
    ProofSubmitted,
    CancellationRequested,
    BalanceUpdated,
    PaymentReceived,
    PaymentValidated,
    PaymentDeleted,
    FeeUpdated,
    PersonalFeeUpdated,
    ClientChanged,
    UserUpdated,
    SettingsUpdated,
    RefreshStats,
    RefreshUserData,
    RefreshValidated,
    BadgeCountUpdated,
    /// Generic "refetch everything" directive.
    ForceRefresh,
    /// Informational push with no data impact.
    Notification,
    /// The session was terminated; UI should redirect to sign-in.
    SessionExpired,
    /// Anything the engine does not recognize.
    Other(String),
}

impl EventKind {
    /// Parse the `type` field of a push message.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "TRANSACTION_CREATED" => EventKind::TransactionCreated,
            "TRANSACTION_UPDATED" => EventKind::TransactionUpdated,
            "TRANSACTION_STATUS_CHANGE" => EventKind::TransactionStatusChanged,
            "TRANSACTION_VALIDATED" => EventKind::TransactionValidated,
            "TRANSACTION_DELETED" => EventKind::TransactionDeleted,
            "TRANSACTION_DELETED_BY_USER" => EventKind::TransactionDeletedByUser,
            "TRANSACTION_DELETED_BY_ADMIN" => EventKind::TransactionDeletedByAdmin,
            "PROOF_SUBMITTED" => EventKind::ProofSubmitted,
            "CANCELLATION_REQUESTED" => EventKind::CancellationRequested,
            "BALANCE_UPDATED" => EventKind::BalanceUpdated,
            "PAYMENT_RECEIVED" | "PAYMENT_CREATED" => EventKind::PaymentReceived,
            "PAYMENT_VALIDATED" => EventKind::PaymentValidated,
            "PAYMENT_DELETED" => EventKind::PaymentDeleted,
            "FEE_PERCENTAGE_UPDATED" => EventKind::FeeUpdated,
            "PERSONAL_FEE_UPDATED" => EventKind::PersonalFeeUpdated,
            "CLIENT_CREATED" | "CLIENT_UPDATED" | "CLIENT_DELETED" => EventKind::ClientChanged,
            "USER_UPDATED" => EventKind::UserUpdated,
            "SYSTEM_SETTINGS_UPDATED" => EventKind::SettingsUpdated,
            "REFRESH_STATS" => EventKind::RefreshStats,
            "REFRESH_USER_DATA" => EventKind::RefreshUserData,
            "REFRESH_VALIDATED" => EventKind::RefreshValidated,
            "BADGE_COUNT_UPDATE" => EventKind::BadgeCountUpdated,
            "FORCE_REFRESH_ALL" | "FORCE_REFRESH" => EventKind::ForceRefresh,
            "TEST_NOTIFICATION" | "NOTIFICATION" => EventKind::Notification,
            "SESSION_EXPIRED" => EventKind::SessionExpired,
            other => EventKind::Other(other.to_string()),
        }
    }

    /// Parse a local application signal name (kebab-case).
    ///
    /// Relays of push messages carry a `websocket-` prefix and map to the
    /// same kind as the message they relay.
    pub fn from_signal(name: &str) -> Self {
        let name = name.trim();
        let name = name.strip_prefix("websocket-").unwrap_or(name);
        let wire = name.replace('-', "_").to_ascii_uppercase();
        match wire.as_str() {
            "FORCE_REFRESH" | "FORCE_REFRESH_ALL" | "DATA_REFRESH" => EventKind::ForceRefresh,
            "BADGE_COUNT_UPDATED" | "FORCE_PENDING_REFRESH" | "TAB_SWITCHED_TO_PENDING" => {
                EventKind::BadgeCountUpdated
            }
            "TRANSACTION_STATUS_CHANGED" => EventKind::TransactionStatusChanged,
            "TRANSACTION_DELETED_ADMIN" => EventKind::TransactionDeletedByAdmin,
            "TRANSACTION_DELETED_USER" => EventKind::TransactionDeletedByUser,
            "STATS_UPDATE" | "STATS_UPDATED" => EventKind::RefreshStats,
            "AUTH_DATA_SYNC_REQUIRED" => EventKind::RefreshUserData,
            _ => EventKind::from_wire(&wire),
        }
    }

    /// Canonical wire name.
    pub fn wire_name(&self) -> &str {
        match self {
            EventKind::TransactionCreated => "TRANSACTION_CREATED",
            EventKind::TransactionUpdated => "TRANSACTION_UPDATED",
            EventKind::TransactionStatusChanged => "TRANSACTION_STATUS_CHANGE",
            EventKind::TransactionValidated => "TRANSACTION_VALIDATED",
            EventKind::TransactionDeleted => "TRANSACTION_DELETED",
            EventKind::TransactionDeletedByUser => "TRANSACTION_DELETED_BY_USER",
            EventKind::TransactionDeletedByAdmin => "TRANSACTION_DELETED_BY_ADMIN",
            EventKind::ProofSubmitted => "PROOF_SUBMITTED",
            EventKind::CancellationRequested => "CANCELLATION_REQUESTED",
            EventKind::BalanceUpdated => "BALANCE_UPDATED",
            EventKind::PaymentReceived => "PAYMENT_RECEIVED",
            EventKind::PaymentValidated => "PAYMENT_VALIDATED",
            EventKind::PaymentDeleted => "PAYMENT_DELETED",
            EventKind::FeeUpdated => "FEE_PERCENTAGE_UPDATED",
            EventKind::PersonalFeeUpdated => "PERSONAL_FEE_UPDATED",
            EventKind::ClientChanged => "CLIENT_UPDATED",
            EventKind::UserUpdated => "USER_UPDATED",
            EventKind::SettingsUpdated => "SYSTEM_SETTINGS_UPDATED",
            EventKind::RefreshStats => "REFRESH_STATS",
            EventKind::RefreshUserData => "REFRESH_USER_DATA",
            EventKind::RefreshValidated => "REFRESH_VALIDATED",
            EventKind::BadgeCountUpdated => "BADGE_COUNT_UPDATE",
            EventKind::ForceRefresh => "FORCE_REFRESH_ALL",
            EventKind::Notification => "TEST_NOTIFICATION",
            EventKind::SessionExpired => "SESSION_EXPIRED",
            EventKind::Other(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Where an event entered the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// Server push over the duplex connection.
    Push,
    /// A mutation issued by this client completed.
    Mutation,
    /// A named signal raised by another view.
    Signal,
    /// Raised by the engine itself (session, network).
    Engine,
}

/// The normalized unit flowing through the [`EventBus`](super::EventBus).
#[derive(Clone, Debug, PartialEq)]
pub struct SyncEvent {
    pub kind: EventKind,
    /// User the change is scoped to, when known.
    pub user_id: Option<UserId>,
    /// Additional keys to invalidate verbatim.
    pub related_keys: Vec<CacheKey>,
    /// Original payload, if any.
    pub raw: Option<serde_json::Value>,
    pub source: EventSource,
}

impl SyncEvent {
    pub fn new(kind: EventKind, source: EventSource) -> Self {
        Self {
            kind,
            user_id: None,
            related_keys: Vec::new(),
            raw: None,
            source,
        }
    }

    /// Build an event from a push message type and payload.
    ///
    /// The user scope is read from `userId` (or `user_id`) in the payload.
    pub fn from_push(kind_name: &str, payload: serde_json::Value) -> Self {
        let user_id = user_id_from_payload(&payload);
        Self {
            kind: EventKind::from_wire(kind_name),
            user_id,
            related_keys: Vec::new(),
            raw: Some(payload),
            source: EventSource::Push,
        }
    }

    /// Build an event from a local signal name.
    pub fn signal(name: &str) -> Self {
        Self::new(EventKind::from_signal(name), EventSource::Signal)
    }

    pub fn mutation(kind: EventKind) -> Self {
        Self::new(kind, EventSource::Mutation)
    }

    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_related_key(mut self, key: impl Into<CacheKey>) -> Self {
        self.related_keys.push(key.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        if self.user_id.is_none() {
            self.user_id = user_id_from_payload(&raw);
        }
        self.raw = Some(raw);
        self
    }
}

fn user_id_from_payload(payload: &serde_json::Value) -> Option<UserId> {
    let field = payload.get("userId").or_else(|| payload.get("user_id"))?;
    match field {
        serde_json::Value::Number(n) => n.as_u64().map(UserId),
        serde_json::Value::String(s) => s.parse().ok().map(UserId),
        _ => None,
    }
}

/// Predicate deciding which events a subscriber receives.
#[derive(Clone, Default)]
pub struct EventFilter {
    /// Only these kinds (None = all kinds).
    pub kinds: Option<Vec<EventKind>>,

    /// Only these sources (None = all sources).
    pub sources: Option<Vec<EventSource>>,

    /// Only events scoped to this user, or unscoped events.
    pub user_id: Option<UserId>,

    /// Arbitrary extra predicate.
    predicate: Option<Arc<dyn Fn(&SyncEvent) -> bool + Send + Sync>>,
}

impl EventFilter {
    /// Every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the listed kinds.
    pub fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            ..Default::default()
        }
    }

    /// Only events from the listed sources.
    pub fn sources(sources: Vec<EventSource>) -> Self {
        Self {
            sources: Some(sources),
            ..Default::default()
        }
    }

    /// Arbitrary predicate.
    pub fn custom(predicate: impl Fn(&SyncEvent) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Some(Arc::new(predicate)),
            ..Default::default()
        }
    }

    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(ref sources) = self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }
        if let (Some(wanted), Some(actual)) = (self.user_id, event.user_id) {
            if wanted != actual {
                return false;
            }
        }
        match self.predicate {
            Some(ref predicate) => predicate(event),
            None => true,
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("kinds", &self.kinds)
            .field("sources", &self.sources)
            .field("user_id", &self.user_id)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Configuration for a channel subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 256
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: EventFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            filter: EventFilter::all(),
        }
    }
}

/// What a channel subscriber receives.
#[derive(Clone, Debug)]
pub enum Delivery {
    Event(SyncEvent),
    /// Subscription was dropped; nothing follows.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The bus was shut down.
    Closed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to a channel subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive deliveries.
    pub receiver: crossbeam_channel::Receiver<Delivery>,
}

impl SubscriptionHandle {
    /// Receive the next delivery (blocking).
    pub fn recv(&self) -> Result<Delivery, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a delivery (non-blocking).
    pub fn try_recv(&self) -> Result<Delivery, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Delivery, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_names_map_to_wire_kinds() {
        assert_eq!(
            EventKind::from_signal("transaction-deleted-by-admin"),
            EventKind::TransactionDeletedByAdmin
        );
        assert_eq!(EventKind::from_signal("force-refresh"), EventKind::ForceRefresh);
        assert_eq!(EventKind::from_signal("balance-updated"), EventKind::BalanceUpdated);
        assert_eq!(
            EventKind::from_signal("something-else"),
            EventKind::Other("SOMETHING_ELSE".to_string())
        );
    }

    #[test]
    fn test_application_signal_names() {
        let cases = [
            ("transaction-deleted-admin", EventKind::TransactionDeletedByAdmin),
            ("websocket-transaction-deleted", EventKind::TransactionDeleted),
            ("websocket-transaction-created", EventKind::TransactionCreated),
            ("websocket-transaction-validated", EventKind::TransactionValidated),
            ("websocket-balance-updated", EventKind::BalanceUpdated),
            ("websocket-force-refresh", EventKind::ForceRefresh),
            ("force-refresh-all", EventKind::ForceRefresh),
            ("stats-update", EventKind::RefreshStats),
            ("force-pending-refresh", EventKind::BadgeCountUpdated),
            ("tab-switched-to-pending", EventKind::BadgeCountUpdated),
            ("badge-count-updated", EventKind::BadgeCountUpdated),
            ("auth-data-sync-required", EventKind::RefreshUserData),
        ];
        for (name, kind) in cases {
            assert_eq!(EventKind::from_signal(name), kind, "{name}");
        }
    }

    #[test]
    fn test_push_extracts_user_scope() {
        let event = SyncEvent::from_push("BALANCE_UPDATED", json!({"userId": 7}));
        assert_eq!(event.user_id, Some(UserId(7)));

        let event = SyncEvent::from_push("BALANCE_UPDATED", json!({"user_id": "9"}));
        assert_eq!(event.user_id, Some(UserId(9)));

        let event = SyncEvent::from_push("BALANCE_UPDATED", json!({"message": "hi"}));
        assert_eq!(event.user_id, None);
    }

    #[test]
    fn test_filter_user_scope_passes_unscoped_events() {
        let filter = EventFilter::kinds(vec![EventKind::BalanceUpdated]).for_user(UserId(7));

        let scoped = SyncEvent::mutation(EventKind::BalanceUpdated).for_user(UserId(7));
        let other = SyncEvent::mutation(EventKind::BalanceUpdated).for_user(UserId(9));
        let unscoped = SyncEvent::mutation(EventKind::BalanceUpdated);
        let wrong_kind = SyncEvent::mutation(EventKind::PaymentDeleted);

        assert!(filter.matches(&scoped));
        assert!(!filter.matches(&other));
        assert!(filter.matches(&unscoped));
        assert!(!filter.matches(&wrong_kind));
    }
}
