//! Key selectors produced by the router.

use crate::cache::Tier;
use crate::types::CacheKey;
use std::fmt;

/// A set of cache keys to invalidate.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InvalidationTarget {
    /// Exactly this key.
    Exact(CacheKey),
    /// This key and everything underneath it (segment-aware).
    Prefix(CacheKey),
    /// Every key registered with this tier.
    Tier(Tier),
    /// Every key.
    All,
}

impl InvalidationTarget {
    pub fn exact(key: impl Into<CacheKey>) -> Self {
        InvalidationTarget::Exact(key.into())
    }

    pub fn prefix(key: impl Into<CacheKey>) -> Self {
        InvalidationTarget::Prefix(key.into())
    }

    pub fn matches(&self, key: &CacheKey, tier: Tier) -> bool {
        match self {
            InvalidationTarget::Exact(k) => k == key,
            InvalidationTarget::Prefix(prefix) => key.is_within(prefix),
            InvalidationTarget::Tier(t) => *t == tier,
            InvalidationTarget::All => true,
        }
    }
}

impl fmt::Debug for InvalidationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationTarget::Exact(k) => write!(f, "Exact({})", k),
            InvalidationTarget::Prefix(k) => write!(f, "Prefix({}/**)", k),
            InvalidationTarget::Tier(t) => write!(f, "Tier({:?})", t),
            InvalidationTarget::All => f.write_str("All"),
        }
    }
}
