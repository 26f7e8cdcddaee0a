//! Subscriptions and entry snapshots.

use super::policy::{QueryPolicy, Tier};
use crate::error::FetchError;
use crate::types::CacheKey;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// Outcome of one fetch.
pub type FetchResult = std::result::Result<serde_json::Value, FetchError>;

/// Boxed fetch future.
pub type FetchFuture = BoxFuture<'static, FetchResult>;

/// Fetch primitive of a subscription.
pub type FetchFn = Arc<dyn Fn(FetchContext) -> FetchFuture + Send + Sync>;

/// Why a fetch was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOrigin {
    /// A consumer is (or may be) waiting on the result.
    Foreground,
    /// Invalidation, polling or refocus.
    Background,
}

/// Passed to the fetch primitive on every attempt.
#[derive(Clone, Debug)]
pub struct FetchContext {
    pub key: CacheKey,
    pub origin: FetchOrigin,
    /// 0 for the first attempt.
    pub attempt: u32,
}

/// A registration of interest in a key.
#[derive(Clone)]
pub struct Subscription {
    pub key: CacheKey,
    pub tier: Tier,
    /// Overrides the tier policy when set.
    pub policy: Option<QueryPolicy>,
    pub(crate) fetch: FetchFn,
}

impl Subscription {
    pub fn new<F, Fut>(key: impl Into<CacheKey>, tier: Tier, fetch: F) -> Self
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        Self {
            key: key.into(),
            tier,
            policy: None,
            fetch: Arc::new(move |ctx| fetch(ctx).boxed()),
        }
    }

    pub fn with_policy(mut self, policy: QueryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("tier", &self.tier)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Lifecycle state of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryState {
    Fresh,
    Stale,
    Fetching,
    Error,
}

/// Point-in-time view of a cache entry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub tier: Tier,
    /// Last good value (kept through Stale and Error).
    pub value: Option<serde_json::Value>,
    pub fetched_at: Option<Instant>,
    pub state: EntryState,
    pub error: Option<FetchError>,
    pub generation: u64,
    /// Live subscriptions holding the key.
    pub subscribers: usize,
    /// Fetches started for this key.
    pub fetch_count: u64,
}

impl CacheEntry {
    pub fn is_stale(&self) -> bool {
        self.state != EntryState::Fresh
    }
}
