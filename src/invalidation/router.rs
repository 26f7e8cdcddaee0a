//! Declarative event → key-family table.

use super::target::InvalidationTarget;
use crate::events::{EventKind, SyncEvent};
use crate::types::{CacheKey, UserId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// A group of cache keys that change together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyFamily {
    TransactionList,
    PendingQueue,
    ValidatedList,
    Stats,
    DailyStats,
    Debt,
    Balance,
    Payments,
    Reports,
    Clients,
    Users,
    Notifications,
    Settings,
}

impl KeyFamily {
    /// Root key of the family.
    pub fn root(&self) -> &'static str {
        match self {
            KeyFamily::TransactionList => "/api/transactions",
            KeyFamily::PendingQueue => "/api/transactions/pending",
            KeyFamily::ValidatedList => "/api/transactions/validated",
            KeyFamily::Stats => "/api/stats",
            KeyFamily::DailyStats => "/api/stats/daily",
            KeyFamily::Debt => "/api/debts",
            KeyFamily::Balance => "/api/balance",
            KeyFamily::Payments => "/api/payments",
            KeyFamily::Reports => "/api/reports",
            KeyFamily::Clients => "/api/clients",
            KeyFamily::Users => "/api/users",
            KeyFamily::Notifications => "/api/notifications",
            KeyFamily::Settings => "/api/system/settings",
        }
    }

    /// Whether the family has per-user keys under `{root}/user/{id}`.
    pub fn is_user_scoped(&self) -> bool {
        matches!(
            self,
            KeyFamily::TransactionList
                | KeyFamily::ValidatedList
                | KeyFamily::Stats
                | KeyFamily::Debt
                | KeyFamily::Balance
                | KeyFamily::Payments
                | KeyFamily::Reports
        )
    }

    /// Key of this family for `user` (the root for global families).
    pub fn key(&self, user: Option<UserId>) -> CacheKey {
        let root = CacheKey::from(self.root());
        match user {
            Some(id) if self.is_user_scoped() => root.join("user").join(id),
            _ => root,
        }
    }

    /// Targets covering the family for an event about `user`.
    ///
    /// A scoped family narrows to the user's subtree but keeps the root
    /// key, which lists every user's rows.
    pub fn targets(&self, user: Option<UserId>) -> Vec<InvalidationTarget> {
        match user {
            Some(_) if self.is_user_scoped() => vec![
                InvalidationTarget::Prefix(self.key(user)),
                InvalidationTarget::Exact(CacheKey::from(self.root())),
            ],
            _ => vec![InvalidationTarget::Prefix(self.key(None))],
        }
    }
}

use KeyFamily::*;

/// The static table.
fn families(kind: &EventKind) -> &'static [KeyFamily] {
    match kind {
        EventKind::TransactionCreated => &[
            TransactionList,
            PendingQueue,
            Stats,
            DailyStats,
            Debt,
            Notifications,
        ],
        EventKind::TransactionUpdated | EventKind::TransactionStatusChanged => {
            &[TransactionList, PendingQueue, Stats]
        }
        EventKind::TransactionValidated => &[
            TransactionList,
            PendingQueue,
            ValidatedList,
            Stats,
            DailyStats,
            Debt,
            Balance,
        ],
        EventKind::TransactionDeleted
        | EventKind::TransactionDeletedByUser
        | EventKind::TransactionDeletedByAdmin => &[
            TransactionList,
            PendingQueue,
            Stats,
            DailyStats,
            Debt,
            Balance,
        ],
        EventKind::ProofSubmitted | EventKind::CancellationRequested => {
            &[TransactionList, PendingQueue, Notifications]
        }
        EventKind::BalanceUpdated => &[Balance, Stats, Debt, Users],
        EventKind::PaymentReceived | EventKind::PaymentValidated | EventKind::PaymentDeleted => {
            &[Payments, Debt, Balance, Stats, Reports]
        }
        EventKind::FeeUpdated | EventKind::PersonalFeeUpdated => &[Settings, Users],
        EventKind::ClientChanged => &[Clients],
        EventKind::UserUpdated => &[Users],
        EventKind::SettingsUpdated => &[Settings],
        EventKind::RefreshStats => &[Stats, DailyStats],
        EventKind::RefreshUserData => &[TransactionList, Stats, Debt, Balance],
        EventKind::RefreshValidated => &[ValidatedList],
        EventKind::BadgeCountUpdated => &[Notifications, PendingQueue],
        EventKind::ForceRefresh
        | EventKind::Notification
        | EventKind::SessionExpired
        | EventKind::Other(_) => &[],
    }
}

/// Maps events to the cache keys they make stale.
///
/// Routing is a pure function of the event, so replaying an event or
/// reordering a batch yields the same set of targets.
#[derive(Clone, Debug, Default)]
pub struct InvalidationRouter {
    /// Families for event kinds outside the static table.
    extra: BTreeMap<EventKind, Vec<KeyFamily>>,
}

impl InvalidationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route an additional event kind (typically `EventKind::Other`).
    pub fn with_rule(mut self, kind: EventKind, families: Vec<KeyFamily>) -> Self {
        self.extra.entry(kind).or_default().extend(families);
        self
    }

    /// Targets affected by `event`.
    pub fn route(&self, event: &SyncEvent) -> BTreeSet<InvalidationTarget> {
        let mut targets = BTreeSet::new();

        if event.kind == EventKind::ForceRefresh {
            targets.insert(InvalidationTarget::All);
            return targets;
        }

        let extra = self.extra.get(&event.kind).map(Vec::as_slice).unwrap_or(&[]);
        for family in families(&event.kind).iter().chain(extra) {
            targets.extend(family.targets(event.user_id));
        }
        for key in &event.related_keys {
            targets.insert(InvalidationTarget::Exact(key.clone()));
        }

        trace!(kind = %event.kind, targets = targets.len(), "routed event");
        targets
    }

    /// Union of the targets of every event in `events`.
    pub fn route_all<'a>(
        &self,
        events: impl IntoIterator<Item = &'a SyncEvent>,
    ) -> BTreeSet<InvalidationTarget> {
        events.into_iter().flat_map(|e| self.route(e)).collect()
    }
}
