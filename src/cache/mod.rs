//! Keyed cache of fetched results.
//!
//! Entries move between four states:
//! - `Fresh`: served without a network call
//! - `Stale`: served, but due for revalidation
//! - `Fetching`: a (shared) fetch is in flight
//! - `Error`: the last fetch failed; the last good value is still served
//!
//! Staleness is governed by the entry's [`Tier`].

mod policy;
mod query;
mod store;

pub use policy::{QueryPolicy, RetryPolicy, Tier, TierPolicies};
pub use query::{
    CacheEntry, EntryState, FetchContext, FetchFn, FetchFuture, FetchOrigin, FetchResult,
    Subscription,
};
pub use store::{CacheConfig, CacheStore, InvalidateOptions, QueryHandle};
