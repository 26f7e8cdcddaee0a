//! Staleness tiers and retry policy.

use std::time::Duration;

/// Staleness tier chosen per subscription at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Pending queues, live balances.
    Critical,
    /// Transaction lists, per-user stats.
    Important,
    /// Aggregates and reports.
    Stats,
    /// Settings and reference data; manual refresh only.
    Static,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Critical, Tier::Important, Tier::Stats, Tier::Static];
}

/// Timing policy of a cached query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryPolicy {
    /// How long a fetched value counts as fresh.
    pub stale_time: Duration,
    /// How long a value may be kept at all.
    pub expiry: Duration,
    /// Background refetch period (None = manual only).
    pub refetch_interval: Option<Duration>,
}

impl QueryPolicy {
    pub const fn new(stale_time: Duration, expiry: Duration, refetch_interval: Option<Duration>) -> Self {
        Self {
            stale_time,
            expiry,
            refetch_interval,
        }
    }

    /// Default policy of a tier.
    pub const fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Critical => Self::new(
                Duration::from_secs(15),
                Duration::from_secs(60),
                Some(Duration::from_secs(30)),
            ),
            Tier::Important => Self::new(
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                Some(Duration::from_secs(2 * 60)),
            ),
            Tier::Stats => Self::new(
                Duration::from_secs(2 * 60),
                Duration::from_secs(10 * 60),
                Some(Duration::from_secs(5 * 60)),
            ),
            Tier::Static => Self::new(
                Duration::from_secs(10 * 60),
                Duration::from_secs(30 * 60),
                None,
            ),
        }
    }

    /// Every duration multiplied by `factor`.
    pub fn widened(&self, factor: u32) -> Self {
        let factor = factor.max(1);
        Self {
            stale_time: self.stale_time * factor,
            expiry: self.expiry * factor,
            refetch_interval: self.refetch_interval.map(|d| d * factor),
        }
    }
}

/// Per-tier policy table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierPolicies {
    pub critical: QueryPolicy,
    pub important: QueryPolicy,
    pub stats: QueryPolicy,
    pub static_data: QueryPolicy,
}

impl TierPolicies {
    pub fn get(&self, tier: Tier) -> QueryPolicy {
        match tier {
            Tier::Critical => self.critical,
            Tier::Important => self.important,
            Tier::Stats => self.stats,
            Tier::Static => self.static_data,
        }
    }
}

impl Default for TierPolicies {
    fn default() -> Self {
        Self {
            critical: QueryPolicy::for_tier(Tier::Critical),
            important: QueryPolicy::for_tier(Tier::Important),
            stats: QueryPolicy::for_tier(Tier::Stats),
            static_data: QueryPolicy::for_tier(Tier::Static),
        }
    }
}

/// Capped exponential retry for failed fetches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `min(base * 2^retry, max)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Variant used on slow links: fewer attempts, longer delays.
    pub fn for_slow_connection(&self) -> Self {
        Self {
            retries: self.retries.saturating_sub(1).max(1).min(self.retries),
            base_delay: self.base_delay * 2,
            max_delay: self.max_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}
