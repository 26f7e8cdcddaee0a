//! Process-wide wiring of the sync components.

use crate::cache::{
    CacheConfig, CacheStore, FetchOrigin, InvalidateOptions, QueryHandle, RetryPolicy,
    Subscription, Tier, TierPolicies,
};
use crate::connection::{ConnectionManager, Connector, ReconnectPolicy, WsConnector};
use crate::error::{FetchError, Result, SyncError};
use crate::events::{
    EventBus, EventFilter, EventKind, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SyncEvent,
};
use crate::http::{HttpRequest, Requester, ReqwestRequester};
use crate::invalidation::{InvalidationRouter, InvalidationTarget};
use crate::network::{NetworkChange, NetworkMonitor, NetworkSignal};
use crate::session::{
    AuthState, FileSessionStore, MemorySessionStore, SessionConfig, SessionGuard, SessionStore,
};
use crate::types::{CacheKey, Identity, UserId};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Configuration for a [`SyncEngine`].
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Base URL of the HTTP API.
    pub api_base_url: String,

    /// URL of the push endpoint.
    pub push_url: String,

    pub reconnect: ReconnectPolicy,
    pub retry: RetryPolicy,
    pub policies: TierPolicies,

    /// Factor applied to staleness, expiry and polling on slow links.
    pub slow_multiplier: u32,

    /// Session verification endpoint.
    pub verify_path: String,

    /// Interval of the liveness check while the session is unverified.
    pub liveness_interval: Duration,

    /// Soft bound on cached entries.
    pub max_entries: usize,

    /// Where the last identity is persisted. In-memory when unset.
    pub session_path: Option<PathBuf>,

    /// Buffer of channel subscriptions created through the engine.
    pub event_buffer_size: usize,

    /// Interval of the expired-entry sweep.
    pub sweep_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".to_string(),
            push_url: "ws://localhost:5000/ws".to_string(),
            reconnect: ReconnectPolicy::default(),
            retry: RetryPolicy::default(),
            policies: TierPolicies::default(),
            slow_multiplier: 3,
            verify_path: "/api/auth/me".to_string(),
            liveness_interval: Duration::from_secs(30),
            max_entries: 500,
            session_path: None,
            event_buffer_size: 256,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl SyncConfig {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            policies: self.policies,
            retry: self.retry,
            slow_multiplier: self.slow_multiplier,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            verify_path: self.verify_path.clone(),
            liveness_interval: self.liveness_interval,
        }
    }
}

/// The sync engine: one per signed-in application process.
///
/// Push messages, local mutations and view signals are published on the
/// [`EventBus`]; the [`InvalidationRouter`] turns each into cache targets
/// which are invalidated and refetched. Every request goes through the
/// [`SessionGuard`].
///
/// # Lifecycle
///
/// 1. [`start`](Self::start) restores the last identity, connects, and
///    spawns polling, liveness and sweep tasks.
/// 2. [`login`](Self::login) / [`logout`](Self::logout) switch users.
/// 3. [`shutdown`](Self::shutdown) stops all background work.
pub struct SyncEngine {
    config: SyncConfig,
    bus: Arc<EventBus>,
    cache: CacheStore,
    router: Arc<InvalidationRouter>,
    guard: Arc<SessionGuard>,
    connection: Arc<ConnectionManager>,
    network: Arc<NetworkMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    routing: SubscriptionId,
}

impl SyncEngine {
    /// Engine over HTTP (reqwest) and WebSocket transports.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let requester: Arc<dyn Requester> = Arc::new(ReqwestRequester::new(&config.api_base_url)?);
        let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(&config.push_url));
        let store: Arc<dyn SessionStore> = match config.session_path {
            Some(ref path) => Arc::new(FileSessionStore::new(path)),
            None => Arc::new(MemorySessionStore::new()),
        };
        Ok(Self::with_parts(config, requester, connector, store))
    }

    /// Engine over caller-provided transports and session storage.
    pub fn with_parts(
        config: SyncConfig,
        requester: Arc<dyn Requester>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self::with_router(config, requester, connector, store, InvalidationRouter::new())
    }

    /// Like [`with_parts`](Self::with_parts) with a customized router.
    pub fn with_router(
        config: SyncConfig,
        requester: Arc<dyn Requester>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn SessionStore>,
        router: InvalidationRouter,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let cache = CacheStore::new(config.cache_config());
        let router = Arc::new(router);
        let guard = Arc::new(SessionGuard::new(
            requester,
            store,
            bus.clone(),
            config.session_config(),
        ));
        let connection = Arc::new(ConnectionManager::new(connector, bus.clone(), config.reconnect));
        let network = Arc::new(NetworkMonitor::new());

        let routing = {
            let cache = cache.clone();
            let router = router.clone();
            bus.subscribe(EventFilter::all(), move |event| {
                apply_event(&router, &cache, event);
            })
        };

        {
            let cache = cache.clone();
            let connection = connection.clone();
            guard.on_logout(move || {
                connection.disconnect();
                cache.clear_all();
            });
        }

        {
            let cache = cache.clone();
            network.on_change(move |change| apply_network_change(&cache, change));
        }

        Self {
            config,
            bus,
            cache,
            router,
            guard,
            connection,
            network,
            tasks: Mutex::new(Vec::new()),
            routing,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn router(&self) -> &InvalidationRouter {
        &self.router
    }

    pub fn session(&self) -> &Arc<SessionGuard> {
        &self.guard
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    // --- Lifecycle ---

    /// Restore the persisted identity and start background work.
    ///
    /// The restored identity is usable immediately; it is verified in the
    /// background. Calling `start` again is a no-op.
    pub fn start(&self) -> Result<Option<Identity>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(self.guard.current_user());
        }

        let identity = match self.guard.current_user() {
            Some(user) => Some(user),
            None => {
                let restored = self.guard.restore();
                if let Some(ref user) = restored {
                    info!(user = %user.id, "resuming session");
                    self.connection.connect(user.clone())?;
                    let guard = self.guard.clone();
                    tasks.push(runtime.spawn(async move {
                        if let Err(e) = guard.verify_session().await {
                            debug!(error = %e, "startup verification did not confirm the session");
                        }
                    }));
                }
                restored
            }
        };

        for tier in Tier::ALL {
            if self.cache.policy(tier).refetch_interval.is_none() {
                continue;
            }
            tasks.push(runtime.spawn(poll_tier(
                self.cache.clone(),
                self.network.clone(),
                self.guard.clone(),
                tier,
            )));
        }

        tasks.push(runtime.spawn(self.guard.clone().run_liveness()));
        tasks.push(runtime.spawn(sweep(self.cache.clone(), self.config.sweep_interval)));

        Ok(identity)
    }

    /// Establish a session for `identity` and open the push connection.
    pub fn login(&self, identity: Identity) -> Result<()> {
        let previous = self.guard.current_user().map(|u| u.id);
        if previous.is_some() && previous != Some(identity.id) {
            self.cache.clear_all();
        }
        self.guard.login(identity.clone());
        self.connection.connect(identity)
    }

    /// Sign out: clears the cache, closes the connection and forgets the
    /// persisted identity.
    pub fn logout(&self) {
        self.guard.logout();
        self.cache.clear_all();
        self.connection.disconnect();
    }

    /// Stop background tasks and close the connection.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.connection.disconnect();
        self.bus.unsubscribe(self.routing);
        self.bus.close();
        info!("sync engine stopped");
    }

    // --- Queries ---

    /// Register interest in `key`, fetched with a guarded `GET` of the key
    /// path.
    pub fn query(&self, key: impl Into<CacheKey>, tier: Tier) -> QueryHandle {
        let guard = self.guard.clone();
        let subscription = Subscription::new(key, tier, move |ctx| {
            let guard = guard.clone();
            async move { guard.get_json(ctx.key.as_str(), ctx.origin).await }
        });
        self.cache.register(subscription)
    }

    /// Register a subscription with its own fetch primitive.
    pub fn register(&self, subscription: Subscription) -> QueryHandle {
        self.cache.register(subscription)
    }

    pub async fn get(&self, key: &CacheKey) -> Result<serde_json::Value> {
        self.cache.get(key).await
    }

    // --- Events ---

    /// Send a request on behalf of the user and, on success, publish
    /// `event` so dependent keys are refetched.
    pub async fn mutate(
        &self,
        request: HttpRequest,
        event: SyncEvent,
    ) -> std::result::Result<serde_json::Value, FetchError> {
        let body = self
            .guard
            .execute(request, FetchOrigin::Foreground)
            .await?
            .into_result()?;
        self.bus.publish(event);
        Ok(body)
    }

    /// Publish the completion of a local mutation.
    pub fn mutation_completed(&self, kind: EventKind, user: Option<UserId>) {
        let mut event = SyncEvent::mutation(kind);
        if let Some(user) = user {
            event = event.for_user(user);
        }
        self.bus.publish(event);
    }

    /// Publish a named local signal (`transaction-deleted`, `force-refresh`).
    pub fn signal(&self, name: &str) {
        self.bus.publish(SyncEvent::signal(name));
    }

    pub fn publish(&self, event: SyncEvent) {
        self.bus.publish(event);
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(filter, handler)
    }

    pub fn subscribe_channel(&self, filter: EventFilter) -> SubscriptionHandle {
        self.bus.subscribe_channel(SubscriptionConfig {
            buffer_size: self.config.event_buffer_size,
            filter,
        })
    }

    /// The application regained focus.
    pub fn on_focus(&self) -> usize {
        refresh_live_tiers(&self.cache)
    }

    /// Feed a connectivity observation.
    pub fn report_network(&self, signal: NetworkSignal) -> Option<NetworkChange> {
        self.network.report(signal)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn apply_event(router: &InvalidationRouter, cache: &CacheStore, event: &SyncEvent) {
    let targets = router.route(event);
    if targets.is_empty() {
        return;
    }
    let matched: usize = targets
        .iter()
        .map(|target| cache.invalidate(target, InvalidateOptions::refetch()))
        .sum();
    debug!(
        kind = %event.kind,
        source = ?event.source,
        targets = targets.len(),
        matched,
        "applied event"
    );
}

fn apply_network_change(cache: &CacheStore, change: &NetworkChange) {
    if change.speed_changed() {
        cache.set_slow_connection(change.current.slow);
    }
    if change.came_online() {
        refresh_live_tiers(cache);
    }
}

/// Invalidate and refetch the Critical and Important tiers.
fn refresh_live_tiers(cache: &CacheStore) -> usize {
    [Tier::Critical, Tier::Important]
        .into_iter()
        .map(|tier| cache.invalidate(&InvalidationTarget::Tier(tier), InvalidateOptions::refetch()))
        .sum()
}

async fn poll_tier(
    cache: CacheStore,
    network: Arc<NetworkMonitor>,
    guard: Arc<SessionGuard>,
    tier: Tier,
) {
    loop {
        let Some(interval) = cache.policy(tier).refetch_interval else {
            return;
        };
        tokio::time::sleep(interval).await;

        if !network.is_online() {
            debug!(?tier, "offline, skipping scheduled revalidation");
            continue;
        }
        match guard.auth_state() {
            AuthState::Authenticated | AuthState::Unverified => {
                cache.revalidate_tier(tier);
            }
            state => debug!(?tier, ?state, "no session, skipping scheduled revalidation"),
        }
    }
}

async fn sweep(cache: CacheStore, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let evicted = cache.evict_expired();
        if evicted > 0 {
            debug!(evicted, "sweep");
        }
    }
}
