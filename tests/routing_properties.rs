//! Property tests for invalidation routing.

use ledger_sync::{
    CacheKey, CacheStore, InvalidateOptions, InvalidationRouter, InvalidationTarget, Subscription,
    SyncEvent, Tier,
};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;

const WIRE_TYPES: [&str; 16] = [
    "TRANSACTION_CREATED",
    "TRANSACTION_VALIDATED",
    "TRANSACTION_DELETED",
    "TRANSACTION_DELETED_BY_ADMIN",
    "PROOF_SUBMITTED",
    "BALANCE_UPDATED",
    "PAYMENT_RECEIVED",
    "PAYMENT_DELETED",
    "FEE_PERCENTAGE_UPDATED",
    "CLIENT_CREATED",
    "USER_UPDATED",
    "REFRESH_STATS",
    "REFRESH_USER_DATA",
    "BADGE_COUNT_UPDATE",
    "TEST_NOTIFICATION",
    "EXCHANGE_RATE_UPDATED",
];

const KEYS: [&str; 10] = [
    "/api/transactions",
    "/api/transactions/user/7",
    "/api/transactions/user/9",
    "/api/transactions/pending",
    "/api/stats/user/7",
    "/api/stats/daily",
    "/api/balance/user/7",
    "/api/payments",
    "/api/clients",
    "/api/system/settings",
];

fn event_strategy() -> impl Strategy<Value = SyncEvent> {
    (
        prop::sample::select(WIRE_TYPES.to_vec()),
        prop::option::of(1u64..20),
    )
        .prop_map(|(kind, user)| match user {
            Some(id) => SyncEvent::from_push(kind, json!({ "userId": id })),
            None => SyncEvent::from_push(kind, json!({})),
        })
}

fn affected(targets: &BTreeSet<InvalidationTarget>) -> BTreeSet<&'static str> {
    KEYS.iter()
        .copied()
        .filter(|key| {
            targets
                .iter()
                .any(|t| t.matches(&CacheKey::from(*key), Tier::Important))
        })
        .collect()
}

fn stale_after(events: &[SyncEvent]) -> BTreeSet<CacheKey> {
    let cache = CacheStore::default();
    let handles: Vec<_> = KEYS
        .iter()
        .map(|key| {
            cache.register(Subscription::new(*key, Tier::Important, |_ctx| async {
                Ok(json!(null))
            }))
        })
        .collect();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    runtime.block_on(async {
        for handle in &handles {
            handle.get().await.unwrap();
        }
    });
    assert!(cache.stale_keys().is_empty());

    let router = InvalidationRouter::new();
    for event in events {
        for target in router.route(event) {
            cache.invalidate(&target, InvalidateOptions::mark_only());
        }
    }
    let stale = cache.stale_keys();
    drop(handles);
    stale
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn routing_is_idempotent(events in prop::collection::vec(event_strategy(), 1..8)) {
        let router = InvalidationRouter::new();
        let once = router.route_all(&events);
        let doubled: Vec<SyncEvent> = events.iter().chain(events.iter()).cloned().collect();
        prop_assert_eq!(router.route_all(&doubled), once);
    }

    #[test]
    fn routing_is_order_independent(events in prop::collection::vec(event_strategy(), 1..8)) {
        let router = InvalidationRouter::new();
        let mut reversed = events.clone();
        reversed.reverse();
        prop_assert_eq!(
            affected(&router.route_all(&events)),
            affected(&router.route_all(&reversed))
        );
    }

    #[test]
    fn cache_effect_is_order_independent(events in prop::collection::vec(event_strategy(), 1..8)) {
        let mut reversed = events.clone();
        reversed.reverse();
        prop_assert_eq!(stale_after(&events), stale_after(&reversed));
    }

    #[test]
    fn scoped_events_never_touch_other_users(kind in prop::sample::select(WIRE_TYPES.to_vec())) {
        let router = InvalidationRouter::new();
        let targets = router.route(&SyncEvent::from_push(kind, json!({ "userId": 7 })));
        let other = CacheKey::from("/api/transactions/user/9");
        prop_assert!(!targets.iter().any(|t| t.matches(&other, Tier::Important)));
    }
}
