//! # Ledger Sync
//!
//! Client-side real-time synchronization for multi-user ledger dashboards.
//! Keeps a local cache of server data consistent with the server under an
//! unreliable push connection, expiring sessions and slow networks.
//!
//! ## Core Concepts
//!
//! - **Cache**: Keyed results with per-tier staleness, shared in-flight
//!   fetches and stale-while-revalidate reads
//! - **Events**: Push messages, local mutations and view signals normalized
//!   into one [`SyncEvent`] vocabulary
//! - **Invalidation**: A declarative table from event kind to affected keys
//! - **Session**: 401 detection, silent recovery and terminal sign-out
//! - **Connection**: One push connection with bounded reconnection
//! - **Network**: Online/offline and slow-link adaptation
//!
//! ## Example
//!
//! ```ignore
//! use ledger_sync::{SyncConfig, SyncEngine, Tier};
//!
//! let engine = SyncEngine::new(SyncConfig {
//!     api_base_url: "https://ledger.example".into(),
//!     push_url: "wss://ledger.example/ws".into(),
//!     ..Default::default()
//! })?;
//! engine.start()?;
//!
//! let pending = engine.query("/api/transactions/pending", Tier::Critical);
//! let rows = pending.get().await?;
//!
//! // Another view deleted a transaction.
//! engine.signal("transaction-deleted");
//! ```

pub mod cache;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod invalidation;
pub mod network;
pub mod session;
pub mod types;

// Re-exports
pub use cache::{
    CacheConfig, CacheEntry, CacheStore, EntryState, FetchContext, FetchOrigin, InvalidateOptions,
    QueryHandle, QueryPolicy, RetryPolicy, Subscription, Tier, TierPolicies,
};
pub use connection::{
    Channel, ConnectionManager, ConnectionState, Connector, ReconnectPolicy, WsConnector,
};
pub use engine::{SyncConfig, SyncEngine};
pub use error::{FetchError, Result, SyncError};
pub use events::{
    Delivery, DropReason, EventBus, EventFilter, EventKind, EventSource, SubscriptionConfig,
    SubscriptionHandle, SubscriptionId, SyncEvent,
};
pub use http::{HttpRequest, HttpResponse, Method, Requester, ReqwestRequester};
pub use invalidation::{InvalidationRouter, InvalidationTarget, KeyFamily};
pub use network::{NetworkChange, NetworkMonitor, NetworkSignal, NetworkStatus};
pub use session::{
    AuthState, FileSessionStore, MemorySessionStore, SessionConfig, SessionGuard, SessionState,
    SessionStore,
};
pub use types::*;
