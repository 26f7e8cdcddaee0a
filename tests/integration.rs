//! End-to-end scenarios for the sync engine.

mod common;

use common::*;
use ledger_sync::{
    AuthState, ConnectionState, Delivery, EntryState, EventFilter, EventKind, FileSessionStore,
    NetworkSignal, SyncConfig, SyncEngine, Tier, UserId,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

// --- Push-driven invalidation ---

#[tokio::test(start_paused = true)]
async fn test_admin_deletion_refetches_only_the_affected_user() {
    let api = MockApi::new(admin());
    let (connector, push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector.clone());
    engine.login(admin()).unwrap();

    let list7 = engine.query("/api/transactions/user/7", Tier::Important);
    let stats7 = engine.query("/api/stats/user/7", Tier::Stats);
    let list9 = engine.query("/api/transactions/user/9", Tier::Important);
    for handle in [&list7, &stats7, &list9] {
        handle.get().await.unwrap();
    }
    assert!(engine.connection().is_connected());

    push.send(r#"{"type":"TRANSACTION_DELETED_BY_ADMIN","payload":{"userId":7}}"#.into())
        .unwrap();
    settle(ms(5)).await;

    assert_eq!(list7.peek().unwrap().state, EntryState::Fetching);
    assert_eq!(stats7.peek().unwrap().state, EntryState::Fetching);
    assert_eq!(list9.peek().unwrap().state, EntryState::Fresh);

    settle(ms(50)).await;
    assert_eq!(list7.get().await.unwrap()["version"], 2);
    assert_eq!(stats7.get().await.unwrap()["version"], 2);
    assert_eq!(list9.get().await.unwrap()["version"], 1);
    assert_eq!(api.count("/api/transactions/user/9"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scoped_push_refreshes_global_lists() {
    let api = MockApi::new(admin());
    let (connector, push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector);
    engine.login(admin()).unwrap();

    let all = engine.query("/api/transactions", Tier::Important);
    let stats = engine.query("/api/stats", Tier::Stats);
    let list9 = engine.query("/api/transactions/user/9", Tier::Important);
    for handle in [&all, &stats, &list9] {
        handle.get().await.unwrap();
    }

    push.send(r#"{"type":"TRANSACTION_CREATED","userId":7}"#.into())
        .unwrap();
    settle(ms(5)).await;
    assert_eq!(all.peek().unwrap().state, EntryState::Fetching);
    assert_eq!(stats.peek().unwrap().state, EntryState::Fetching);
    assert_eq!(list9.peek().unwrap().state, EntryState::Fresh);

    settle(ms(50)).await;
    assert_eq!(api.count("/api/transactions"), 2);
    assert_eq!(api.count("/api/stats"), 2);
    assert_eq!(api.count("/api/transactions/user/9"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registration_is_sent_on_open() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api, connector.clone());

    engine.login(user(7)).unwrap();
    settle(ms(1)).await;

    let sent = connector.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    let register: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(register["type"], "register");
    assert_eq!(register["userId"], 7);
    assert_eq!(register["role"], "user");
}

#[tokio::test(start_paused = true)]
async fn test_local_signal_matches_push() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector);
    engine.login(user(7)).unwrap();

    let pending = engine.query("/api/transactions/pending", Tier::Critical);
    let settings = engine.query("/api/system/settings", Tier::Static);
    pending.get().await.unwrap();
    settings.get().await.unwrap();

    engine.signal("transaction-deleted");
    settle(ms(50)).await;

    assert_eq!(api.count("/api/transactions/pending"), 2);
    assert_eq!(api.count("/api/system/settings"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_relayed_and_admin_signals_refresh() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector);
    engine.login(user(7)).unwrap();

    let pending = engine.query("/api/transactions/pending", Tier::Critical);
    let stats = engine.query("/api/stats/daily", Tier::Stats);
    pending.get().await.unwrap();
    stats.get().await.unwrap();

    engine.signal("transaction-deleted-admin");
    settle(ms(50)).await;
    assert_eq!(api.count("/api/transactions/pending"), 2);
    assert_eq!(api.count("/api/stats/daily"), 2);

    engine.signal("websocket-transaction-deleted");
    settle(ms(50)).await;
    assert_eq!(api.count("/api/transactions/pending"), 3);
    assert_eq!(api.count("/api/stats/daily"), 3);

    engine.signal("stats-update");
    settle(ms(50)).await;
    assert_eq!(api.count("/api/transactions/pending"), 3);
    assert_eq!(api.count("/api/stats/daily"), 4);
}

// --- Session recovery ---

#[tokio::test(start_paused = true)]
async fn test_unauthorized_defers_and_replays_background_refetches_once() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector);
    engine.login(user(7)).unwrap();
    let expired = engine.subscribe_channel(EventFilter::kinds(vec![EventKind::SessionExpired]));

    let balance = engine.query("/api/balance/user/7", Tier::Critical);
    let list = engine.query("/api/transactions/user/7", Tier::Important);
    let stats = engine.query("/api/stats/user/7", Tier::Stats);
    let debts = engine.query("/api/debts/user/7", Tier::Important);
    for handle in [&balance, &list, &stats, &debts] {
        handle.get().await.unwrap();
    }
    api.reset_calls();
    api.reject_next.store(1, Ordering::SeqCst);

    let trigger = async {
        // The balance request has been rejected; verification is in flight.
        settle(ms(15)).await;
        assert_eq!(engine.session().auth_state(), AuthState::Recovering);
        engine.mutation_completed(EventKind::TransactionCreated, Some(UserId(7)));
        settle(ms(2)).await;
        // Deferred: nothing reached the server yet.
        assert_eq!(api.count("/api/transactions/user/7"), 0);
    };
    let (result, ()) = tokio::join!(balance.refetch(), trigger);
    settle(ms(50)).await;

    assert_eq!(result.unwrap()["version"], 2);
    assert_eq!(api.count("/api/balance/user/7"), 2);
    assert_eq!(api.count("/api/auth/me"), 1);
    for path in [
        "/api/transactions/user/7",
        "/api/stats/user/7",
        "/api/debts/user/7",
    ] {
        assert_eq!(api.count(path), 1, "{path}");
    }
    assert_eq!(list.peek().unwrap().value.unwrap()["version"], 2);
    assert_eq!(engine.session().auth_state(), AuthState::Authenticated);
    assert_eq!(engine.session().recoveries(), 1);
    assert!(expired.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_session_signs_out_once() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector);
    engine.login(user(7)).unwrap();
    let expired = engine.subscribe_channel(EventFilter::kinds(vec![EventKind::SessionExpired]));

    let balance = engine.query("/api/balance/user/7", Tier::Critical);
    let list = engine.query("/api/transactions/user/7", Tier::Important);
    balance.get().await.unwrap();
    list.get().await.unwrap();

    api.session_valid.store(false, Ordering::SeqCst);
    api.reject_next.store(2, Ordering::SeqCst);
    engine.signal("force-refresh");
    settle(ms(100)).await;

    assert_eq!(engine.session().auth_state(), AuthState::LoggedOut);
    assert!(engine.session().current_user().is_none());
    assert!(engine.cache().is_empty());
    assert_eq!(engine.connection().state(), ConnectionState::Disconnected);
    assert_eq!(api.count("/api/auth/me"), 1);

    let notices: Vec<_> = std::iter::from_fn(|| expired.try_recv().ok())
        .filter(|d| matches!(d, Delivery::Event(_)))
        .collect();
    assert_eq!(notices.len(), 1);
}

// --- Connection loss ---

#[tokio::test(start_paused = true)]
async fn test_gives_up_reconnecting_while_polling_continues() {
    let api = MockApi::new(user(7));
    let connector = ScriptedConnector::new(vec![Step::Drop]);
    let engine = engine(api.clone(), connector.clone());
    engine.start().unwrap();
    engine.login(user(7)).unwrap();

    let pending = engine.query("/api/transactions/pending", Tier::Critical);
    pending.get().await.unwrap();

    settle(Duration::from_secs(20)).await;
    assert!(engine.connection().gave_up());
    assert_eq!(connector.attempts(), 6);
    assert_eq!(engine.connection().state(), ConnectionState::Disconnected);

    settle(Duration::from_secs(105)).await;
    assert_eq!(connector.attempts(), 6);
    // Initial fetch plus polls at 30s, 60s, 90s and 120s.
    assert_eq!(api.count("/api/transactions/pending"), 5);
    engine.shutdown();
}

// --- Network ---

#[tokio::test(start_paused = true)]
async fn test_back_online_refreshes_live_tiers_only() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector);
    engine.login(user(7)).unwrap();

    let balance = engine.query("/api/balance/user/7", Tier::Critical);
    let list = engine.query("/api/transactions/user/7", Tier::Important);
    let settings = engine.query("/api/system/settings", Tier::Static);
    for handle in [&balance, &list, &settings] {
        handle.get().await.unwrap();
    }

    assert!(engine.report_network(NetworkSignal::offline()).is_some());
    assert!(!engine.network().is_online());
    let change = engine.report_network(NetworkSignal::online()).unwrap();
    assert!(change.came_online());
    settle(ms(50)).await;

    assert_eq!(api.count("/api/balance/user/7"), 2);
    assert_eq!(api.count("/api/transactions/user/7"), 2);
    assert_eq!(api.count("/api/system/settings"), 1);
    assert_eq!(settings.peek().unwrap().state, EntryState::Fresh);
}

#[tokio::test(start_paused = true)]
async fn test_offline_pauses_polling() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector);
    engine.start().unwrap();
    engine.login(user(7)).unwrap();

    let pending = engine.query("/api/transactions/pending", Tier::Critical);
    pending.get().await.unwrap();
    engine.report_network(NetworkSignal::offline());

    settle(Duration::from_secs(100)).await;
    assert_eq!(api.count("/api/transactions/pending"), 1);

    engine.report_network(NetworkSignal::online());
    settle(ms(50)).await;
    assert_eq!(api.count("/api/transactions/pending"), 2);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_slow_link_widens_schedule() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api, connector);

    engine.report_network(NetworkSignal::online().with_effective_type("2g"));
    assert!(engine.network().is_slow_connection());
    assert!(engine.cache().is_slow_connection());

    let critical = engine.cache().policy(Tier::Critical);
    assert_eq!(critical.stale_time, Duration::from_secs(45));
    assert_eq!(critical.refetch_interval, Some(Duration::from_secs(90)));
    assert_eq!(engine.cache().retry_policy().retries, 1);

    engine.report_network(NetworkSignal::online().with_effective_type("4g"));
    assert!(!engine.cache().is_slow_connection());
    assert_eq!(
        engine.cache().policy(Tier::Critical).stale_time,
        Duration::from_secs(15)
    );
}

#[tokio::test(start_paused = true)]
async fn test_focus_refreshes_live_tiers() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api.clone(), connector);
    engine.login(user(7)).unwrap();

    let balance = engine.query("/api/balance/user/7", Tier::Critical);
    let daily = engine.query("/api/stats/daily", Tier::Stats);
    balance.get().await.unwrap();
    daily.get().await.unwrap();

    assert_eq!(engine.on_focus(), 1);
    settle(ms(50)).await;
    assert_eq!(api.count("/api/balance/user/7"), 2);
    assert_eq!(api.count("/api/stats/daily"), 1);
}

// --- Lifecycle ---

#[tokio::test(start_paused = true)]
async fn test_logout_clears_everything() {
    let api = MockApi::new(user(7));
    let (connector, _push) = ScriptedConnector::open();
    let engine = engine(api, connector);
    engine.login(user(7)).unwrap();
    let expired = engine.subscribe_channel(EventFilter::kinds(vec![EventKind::SessionExpired]));

    let balance = engine.query("/api/balance/user/7", Tier::Critical);
    balance.get().await.unwrap();
    settle(ms(1)).await;
    assert!(engine.connection().is_connected());

    engine.logout();

    assert!(engine.cache().is_empty());
    assert_eq!(engine.connection().state(), ConnectionState::Disconnected);
    assert_eq!(engine.session().auth_state(), AuthState::LoggedOut);
    assert!(expired.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_restored_identity_is_verified_in_background() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.bin");
    let api = MockApi::new(user(7));

    {
        let (connector, _push) = ScriptedConnector::open();
        let engine = SyncEngine::with_parts(
            SyncConfig::default(),
            api.clone(),
            connector,
            Arc::new(FileSessionStore::new(&path)),
        );
        engine.login(user(7)).unwrap();
    }

    let (connector, _push) = ScriptedConnector::open();
    let engine = SyncEngine::with_parts(
        SyncConfig::default(),
        api.clone(),
        connector.clone(),
        Arc::new(FileSessionStore::new(&path)),
    );

    let restored = engine.start().unwrap();
    assert_eq!(restored, Some(user(7)));
    assert_eq!(engine.session().auth_state(), AuthState::Unverified);

    settle(ms(50)).await;
    assert_eq!(engine.session().auth_state(), AuthState::Authenticated);
    assert_eq!(connector.attempts(), 1);
    assert_eq!(api.count("/api/auth/me"), 1);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_stale_restored_identity_is_discarded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.bin");
    let api = MockApi::new(user(7));
    api.session_valid.store(false, Ordering::SeqCst);
    ledger_sync::SessionStore::save(&FileSessionStore::new(&path), &user(7)).unwrap();

    let (connector, _push) = ScriptedConnector::open();
    let engine = SyncEngine::with_parts(
        SyncConfig::default(),
        api,
        connector,
        Arc::new(FileSessionStore::new(&path)),
    );
    let expired = engine.subscribe_channel(EventFilter::kinds(vec![EventKind::SessionExpired]));

    assert!(engine.start().unwrap().is_some());
    settle(ms(50)).await;

    assert_eq!(engine.session().auth_state(), AuthState::LoggedOut);
    assert!(!path.exists());
    assert!(matches!(expired.try_recv(), Ok(Delivery::Event(_))));
    engine.shutdown();
}
