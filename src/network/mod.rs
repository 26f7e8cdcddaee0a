//! Network connectivity monitoring.

mod monitor;

pub use monitor::{
    NetworkChange, NetworkMonitor, NetworkSignal, NetworkStatus, WatchId, SLOW_DOWNLINK_MBPS,
    SLOW_EFFECTIVE_TYPES,
};
