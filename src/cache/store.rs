//! Keyed result cache with stale-while-revalidate semantics.

use super::policy::{QueryPolicy, RetryPolicy, Tier, TierPolicies};
use super::query::{
    CacheEntry, EntryState, FetchContext, FetchFn, FetchFuture, FetchOrigin, FetchResult,
    Subscription,
};
use crate::error::{FetchError, Result, SyncError};
use crate::invalidation::InvalidationTarget;
use crate::types::CacheKey;
use futures::future::{FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type SharedFetch = Shared<FetchFuture>;

/// Cache configuration.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Soft bound on the number of entries. Idle entries are evicted
    /// least-recently-used first; entries with subscribers are never evicted
    /// to make room.
    pub max_entries: usize,

    /// Per-tier staleness policy.
    pub policies: TierPolicies,

    /// Retry policy for failed fetches.
    pub retry: RetryPolicy,

    /// Factor applied to every tier policy on slow connections.
    pub slow_multiplier: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            policies: TierPolicies::default(),
            retry: RetryPolicy::default(),
            slow_multiplier: 3,
        }
    }
}

/// Options for [`CacheStore::invalidate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvalidateOptions {
    /// Start a refetch for matching entries that have subscribers instead
    /// of waiting for the next `get`.
    pub refetch_immediately: bool,
}

impl InvalidateOptions {
    pub fn mark_only() -> Self {
        Self {
            refetch_immediately: false,
        }
    }

    pub fn refetch() -> Self {
        Self {
            refetch_immediately: true,
        }
    }
}

/// The fetch currently owning a key.
struct InFlight {
    generation: u64,
    future: SharedFetch,
}

/// Internal entry state.
struct Entry {
    key: CacheKey,
    tier: Tier,
    policy_override: Option<QueryPolicy>,
    fetch: FetchFn,
    value: Option<serde_json::Value>,
    fetched_at: Option<Instant>,
    state: EntryState,
    error: Option<FetchError>,
    /// Bumped by every fetch start and every invalidation.
    generation: u64,
    inflight: Option<InFlight>,
    refcount: usize,
    fetch_count: u64,
}

impl Entry {
    fn new(sub: &Subscription) -> Self {
        Self {
            key: sub.key.clone(),
            tier: sub.tier,
            policy_override: sub.policy,
            fetch: Arc::clone(&sub.fetch),
            value: None,
            fetched_at: None,
            state: EntryState::Stale,
            error: None,
            generation: 0,
            inflight: None,
            refcount: 0,
            fetch_count: 0,
        }
    }

    /// State as observed at `now`; a Fresh entry past its stale time reads
    /// as Stale.
    fn effective_state(&self, now: Instant, policy: &QueryPolicy) -> EntryState {
        match (self.state, self.fetched_at) {
            (EntryState::Fresh, Some(at)) if now.duration_since(at) < policy.stale_time => {
                EntryState::Fresh
            }
            (EntryState::Fresh, _) => EntryState::Stale,
            (state, _) => state,
        }
    }

    /// Drop the value once it is older than the expiry horizon.
    fn expire_value(&mut self, now: Instant, policy: &QueryPolicy) {
        if let Some(at) = self.fetched_at {
            if self.value.is_some() && now.duration_since(at) >= policy.expiry {
                self.value = None;
                if self.state == EntryState::Fresh {
                    self.state = EntryState::Stale;
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.refcount == 0 && self.inflight.is_none()
    }

    fn snapshot(&self, now: Instant, policy: &QueryPolicy) -> CacheEntry {
        CacheEntry {
            key: self.key.clone(),
            tier: self.tier,
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            state: self.effective_state(now, policy),
            error: self.error.clone(),
            generation: self.generation,
            subscribers: self.refcount,
            fetch_count: self.fetch_count,
        }
    }
}

struct Inner {
    entries: Mutex<LruCache<CacheKey, Entry>>,
    config: CacheConfig,
    slow: AtomicBool,
    /// Bumped by `clear_all`; handles registered in an older epoch re-register.
    epoch: AtomicU64,
    fetches_started: AtomicU64,
}

impl Inner {
    fn policy_for(&self, tier: Tier, policy_override: Option<QueryPolicy>) -> QueryPolicy {
        let base = policy_override.unwrap_or_else(|| self.config.policies.get(tier));
        if self.slow.load(Ordering::Relaxed) {
            base.widened(self.config.slow_multiplier)
        } else {
            base
        }
    }

    fn entry_policy(&self, entry: &Entry) -> QueryPolicy {
        self.policy_for(entry.tier, entry.policy_override)
    }

    fn retry_policy(&self) -> RetryPolicy {
        if self.slow.load(Ordering::Relaxed) {
            self.config.retry.for_slow_connection()
        } else {
            self.config.retry
        }
    }

    /// Start a new fetch generation for `entry` and make it the key's
    /// in-flight fetch. The caller holds the entries lock.
    fn start_fetch(self: &Arc<Self>, entry: &mut Entry, origin: FetchOrigin) -> SharedFetch {
        entry.generation += 1;
        entry.state = EntryState::Fetching;
        entry.fetch_count += 1;
        self.fetches_started.fetch_add(1, Ordering::Relaxed);

        let generation = entry.generation;
        let fetch = Arc::clone(&entry.fetch);
        let key = entry.key.clone();
        let retry = self.retry_policy();
        let weak = Arc::downgrade(self);

        debug!(key = %key, generation, ?origin, "starting fetch");

        let future: FetchFuture = async move {
            let result = fetch_with_retry(&fetch, &key, origin, retry).await;
            match weak.upgrade() {
                Some(inner) => inner.complete(&key, generation, result),
                None => Err(FetchError::Superseded),
            }
        }
        .boxed();

        let shared = future.shared();
        entry.inflight = Some(InFlight {
            generation,
            future: shared.clone(),
        });

        // Keep the fetch running even if nobody awaits it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(shared.clone().map(|_| ()));
        }

        shared
    }

    /// Apply a fetch outcome unless a newer generation owns the key.
    fn complete(&self, key: &CacheKey, generation: u64, result: FetchResult) -> FetchResult {
        let mut entries = self.entries.lock();
        let entry = match entries.peek_mut(key) {
            Some(entry) if entry.generation == generation => entry,
            _ => {
                debug!(key = %key, generation, "discarding superseded fetch result");
                return Err(FetchError::Superseded);
            }
        };

        entry.inflight = None;
        match result {
            Ok(value) => {
                entry.value = Some(value.clone());
                entry.fetched_at = Some(Instant::now());
                entry.state = EntryState::Fresh;
                entry.error = None;
                Ok(value)
            }
            Err(error) => {
                warn!(key = %key, error = %error, "fetch failed");
                entry.state = EntryState::Error;
                entry.error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Insert, making room by evicting the least-recently-used idle entry.
    fn insert(&self, entries: &mut LruCache<CacheKey, Entry>, entry: Entry) {
        if entries.len() >= entries.cap().get() {
            let victim = entries
                .iter()
                .rev()
                .find(|(_, e)| e.is_idle())
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    debug!(key = %key, "evicting least recently used entry");
                    entries.pop(&key);
                }
                None => {
                    if let Some(cap) = NonZeroUsize::new(entries.cap().get().saturating_mul(2)) {
                        entries.resize(cap);
                    }
                }
            }
        }
        entries.put(entry.key.clone(), entry);
    }
}

async fn fetch_with_retry(
    fetch: &FetchFn,
    key: &CacheKey,
    origin: FetchOrigin,
    retry: RetryPolicy,
) -> FetchResult {
    let mut attempt = 0u32;
    loop {
        let ctx = FetchContext {
            key: key.clone(),
            origin,
            attempt,
        };
        match fetch(ctx).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < retry.retries => {
                let delay = retry.delay(attempt);
                debug!(
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying fetch"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Keyed store of fetched results.
///
/// Cloning yields another handle to the same store.
///
/// Every key owns at most one in-flight fetch: concurrent `get`s share it.
/// Fetches are tagged with a per-key generation; invalidation bumps the
/// generation, so a response from a fetch started before the invalidation
/// is discarded instead of overwriting newer state.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Create a new cache store.
    pub fn new(config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(LruCache::new(cap)),
                config,
                slow: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                fetches_started: AtomicU64::new(0),
            }),
        }
    }

    // --- Registration ---

    /// Register interest in a key. The entry lives at least as long as the
    /// returned handle.
    pub fn register(&self, subscription: Subscription) -> QueryHandle {
        let epoch = self.ensure(&subscription, true);
        QueryHandle {
            store: self.clone(),
            subscription,
            epoch: AtomicU64::new(epoch),
        }
    }

    /// Create or update the entry for `subscription`; returns the epoch it
    /// was registered in.
    fn ensure(&self, subscription: &Subscription, add_ref: bool) -> u64 {
        let mut entries = self.inner.entries.lock();
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        if let Some(entry) = entries.get_mut(&subscription.key) {
            entry.fetch = Arc::clone(&subscription.fetch);
            entry.tier = subscription.tier;
            entry.policy_override = subscription.policy;
            if add_ref {
                entry.refcount += 1;
            }
        } else {
            let mut entry = Entry::new(subscription);
            if add_ref {
                entry.refcount = 1;
            }
            self.inner.insert(&mut entries, entry);
        }

        epoch
    }

    fn release(&self, key: &CacheKey, epoch: u64) {
        let mut entries = self.inner.entries.lock();
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if let Some(entry) = entries.peek_mut(key) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
    }

    // --- Reads ---

    /// Read a key.
    ///
    /// - Fresh: the cached value, no network.
    /// - Stale with a value: the value immediately; one refetch is started.
    /// - No value: waits for the (shared) fetch.
    pub async fn get(&self, key: &CacheKey) -> Result<serde_json::Value> {
        loop {
            let pending = {
                let mut entries = self.inner.entries.lock();
                let entry = entries
                    .get_mut(key)
                    .ok_or_else(|| SyncError::NotRegistered(key.to_string()))?;
                let now = Instant::now();
                let policy = self.inner.entry_policy(entry);
                entry.expire_value(now, &policy);

                match entry.effective_state(now, &policy) {
                    EntryState::Fresh if entry.value.is_some() => {
                        return Ok(entry.value.clone().unwrap_or_default());
                    }
                    EntryState::Fetching if entry.inflight.is_some() => {
                        if let Some(ref value) = entry.value {
                            return Ok(value.clone());
                        }
                        match entry.inflight {
                            Some(ref inflight) => inflight.future.clone(),
                            None => self.inner.start_fetch(entry, FetchOrigin::Foreground),
                        }
                    }
                    _ => {
                        let pending = self.inner.start_fetch(entry, FetchOrigin::Foreground);
                        if let Some(ref value) = entry.value {
                            return Ok(value.clone());
                        }
                        pending
                    }
                }
            };

            match pending.await {
                Ok(value) => return Ok(value),
                Err(FetchError::Superseded) => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Register `subscription` without holding a reference and wait for a
    /// fresh value.
    pub async fn prefetch(&self, subscription: Subscription) -> Result<serde_json::Value> {
        self.ensure(&subscription, false);
        self.fetch_now(&subscription.key, false).await
    }

    /// Wait for a value fetched now, joining an in-flight fetch if there is
    /// one. With `force`, a Fresh value does not short-circuit.
    async fn fetch_now(&self, key: &CacheKey, force: bool) -> Result<serde_json::Value> {
        loop {
            let pending = {
                let mut entries = self.inner.entries.lock();
                let entry = entries
                    .get_mut(key)
                    .ok_or_else(|| SyncError::NotRegistered(key.to_string()))?;
                let now = Instant::now();
                let policy = self.inner.entry_policy(entry);

                if !force && entry.effective_state(now, &policy) == EntryState::Fresh {
                    if let Some(ref value) = entry.value {
                        return Ok(value.clone());
                    }
                }
                match entry.inflight {
                    Some(ref inflight) => inflight.future.clone(),
                    None => self.inner.start_fetch(entry, FetchOrigin::Foreground),
                }
            };

            match pending.await {
                Ok(value) => return Ok(value),
                Err(FetchError::Superseded) => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Snapshot of an entry without touching recency or starting fetches.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entries = self.inner.entries.lock();
        let now = Instant::now();
        entries
            .peek(key)
            .map(|entry| entry.snapshot(now, &self.inner.entry_policy(entry)))
    }

    /// Keys that currently read as anything but Fresh.
    pub fn stale_keys(&self) -> BTreeSet<CacheKey> {
        let entries = self.inner.entries.lock();
        let now = Instant::now();
        entries
            .iter()
            .filter(|(_, entry)| {
                entry.effective_state(now, &self.inner.entry_policy(entry)) != EntryState::Fresh
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total fetches started since creation.
    pub fn fetches_started(&self) -> u64 {
        self.inner.fetches_started.load(Ordering::Relaxed)
    }

    // --- Invalidation ---

    /// Mark every entry matching `target` Stale. Returns the number matched.
    pub fn invalidate(&self, target: &InvalidationTarget, options: InvalidateOptions) -> usize {
        self.invalidate_where(|key, tier| target.matches(key, tier), options)
    }

    /// Mark every entry matching `predicate` Stale.
    ///
    /// In-flight fetches of matching entries are superseded. The last good
    /// value is kept for display. With `refetch_immediately`, entries that
    /// have subscribers are refetched right away.
    pub fn invalidate_where<P>(&self, predicate: P, options: InvalidateOptions) -> usize
    where
        P: Fn(&CacheKey, Tier) -> bool,
    {
        let mut entries = self.inner.entries.lock();
        let mut matched = 0;

        for (key, entry) in entries.iter_mut() {
            if !predicate(key, entry.tier) {
                continue;
            }
            matched += 1;

            if let Some(ref inflight) = entry.inflight {
                debug!(key = %key, generation = inflight.generation, "superseding in-flight fetch");
            }
            entry.generation += 1;
            entry.inflight = None;
            entry.state = EntryState::Stale;

            if options.refetch_immediately && entry.refcount > 0 {
                self.inner.start_fetch(entry, FetchOrigin::Background);
            }
        }

        debug!(matched, refetch = options.refetch_immediately, "invalidated entries");
        matched
    }

    /// Scheduled revalidation of one tier: refetch entries with subscribers
    /// that are no longer Fresh and have no fetch in flight. Entries
    /// refreshed recently (e.g. by a push) are skipped.
    pub fn revalidate_tier(&self, tier: Tier) -> usize {
        let mut entries = self.inner.entries.lock();
        let now = Instant::now();
        let mut started = 0;

        for (_, entry) in entries.iter_mut() {
            if entry.tier != tier || entry.refcount == 0 || entry.inflight.is_some() {
                continue;
            }
            let policy = self.inner.entry_policy(entry);
            entry.expire_value(now, &policy);
            if entry.effective_state(now, &policy) != EntryState::Fresh {
                self.inner.start_fetch(entry, FetchOrigin::Background);
                started += 1;
            }
        }

        if started > 0 {
            debug!(?tier, started, "scheduled revalidation");
        }
        started
    }

    /// Drop expired values and evict idle entries that hold none.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        let now = Instant::now();
        let mut evict = Vec::new();

        for (key, entry) in entries.iter_mut() {
            let policy = self.inner.entry_policy(entry);
            entry.expire_value(now, &policy);
            if entry.is_idle() && entry.value.is_none() {
                evict.push(key.clone());
            }
        }

        for key in &evict {
            entries.pop(key);
        }
        if !evict.is_empty() {
            debug!(evicted = evict.len(), "evicted expired entries");
        }
        evict.len()
    }

    /// Drop every entry. Outstanding fetches complete into nothing.
    pub fn clear_all(&self) {
        let mut entries = self.inner.entries.lock();
        let dropped = entries.len();
        entries.clear();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        info!(dropped, "cache cleared");
    }

    // --- Network adaptation ---

    /// Widen staleness/expiry and soften retries while the link is slow.
    pub fn set_slow_connection(&self, slow: bool) {
        let previous = self.inner.slow.swap(slow, Ordering::Relaxed);
        if previous != slow {
            info!(slow, "cache scheduling profile changed");
        }
    }

    pub fn is_slow_connection(&self) -> bool {
        self.inner.slow.load(Ordering::Relaxed)
    }

    /// Effective policy of a tier under the current network profile.
    pub fn policy(&self, tier: Tier) -> QueryPolicy {
        self.inner.policy_for(tier, None)
    }

    /// Effective retry policy under the current network profile.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// A view's reference to a key. Dropping it releases the reference but
/// never cancels a shared fetch.
pub struct QueryHandle {
    store: CacheStore,
    subscription: Subscription,
    epoch: AtomicU64,
}

impl QueryHandle {
    pub fn key(&self) -> &CacheKey {
        &self.subscription.key
    }

    pub fn tier(&self) -> Tier {
        self.subscription.tier
    }

    /// Read the key (see [`CacheStore::get`]).
    pub async fn get(&self) -> Result<serde_json::Value> {
        self.reattach();
        self.store.get(&self.subscription.key).await
    }

    /// Fetch now regardless of freshness and wait for the result.
    pub async fn refetch(&self) -> Result<serde_json::Value> {
        self.reattach();
        self.store.fetch_now(&self.subscription.key, true).await
    }

    pub fn peek(&self) -> Option<CacheEntry> {
        self.store.peek(&self.subscription.key)
    }

    /// Re-register after the cache was cleared underneath this handle.
    fn reattach(&self) {
        let current = self.store.inner.epoch.load(Ordering::SeqCst);
        if self.epoch.load(Ordering::SeqCst) != current {
            let epoch = self.store.ensure(&self.subscription, true);
            self.epoch.store(epoch, Ordering::SeqCst);
        }
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.store
            .release(&self.subscription.key, self.epoch.load(Ordering::SeqCst));
    }
}
