//! Connectivity and link quality tracking.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Downlink below which a connection counts as slow.
pub const SLOW_DOWNLINK_MBPS: f64 = 1.5;

/// Effective connection types that count as slow.
pub const SLOW_EFFECTIVE_TYPES: [&str; 3] = ["slow-2g", "2g", "3g"];

/// A raw observation from the host platform.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkSignal {
    pub online: bool,
    /// `slow-2g`, `2g`, `3g`, `4g` when the platform reports it.
    pub effective_type: Option<String>,
    pub downlink_mbps: Option<f64>,
}

impl NetworkSignal {
    pub fn online() -> Self {
        Self {
            online: true,
            ..Self::default()
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn with_effective_type(mut self, effective_type: impl Into<String>) -> Self {
        self.effective_type = Some(effective_type.into());
        self
    }

    pub fn with_downlink(mut self, mbps: f64) -> Self {
        self.downlink_mbps = Some(mbps);
        self
    }

    /// Whether the signal describes a slow link.
    pub fn is_slow(&self) -> bool {
        let slow_type = self
            .effective_type
            .as_deref()
            .is_some_and(|t| SLOW_EFFECTIVE_TYPES.contains(&t));
        let slow_downlink = self
            .downlink_mbps
            .is_some_and(|mbps| mbps < SLOW_DOWNLINK_MBPS);
        self.online && (slow_type || slow_downlink)
    }
}

/// Classified network status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkStatus {
    pub online: bool,
    pub slow: bool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            online: true,
            slow: false,
        }
    }
}

/// A status change delivered to [`NetworkMonitor::on_change`] handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkChange {
    pub previous: NetworkStatus,
    pub current: NetworkStatus,
}

impl NetworkChange {
    pub fn came_online(&self) -> bool {
        !self.previous.online && self.current.online
    }

    pub fn went_offline(&self) -> bool {
        self.previous.online && !self.current.online
    }

    pub fn speed_changed(&self) -> bool {
        self.previous.slow != self.current.slow
    }
}

type ChangeHandler = Arc<dyn Fn(&NetworkChange) + Send + Sync>;

/// Identifier of an `on_change` registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

/// Tracks online state and link quality and notifies on transitions.
///
/// Starts online and fast. Handlers run synchronously on the reporting
/// thread, only when the classified status actually changes.
pub struct NetworkMonitor {
    status: RwLock<NetworkStatus>,
    handlers: RwLock<BTreeMap<WatchId, ChangeHandler>>,
    next_id: AtomicU64,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(NetworkStatus::default()),
            handlers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.read()
    }

    pub fn is_online(&self) -> bool {
        self.status.read().online
    }

    pub fn is_slow_connection(&self) -> bool {
        self.status.read().slow
    }

    pub fn on_change<F>(&self, handler: F) -> WatchId
    where
        F: Fn(&NetworkChange) + Send + Sync + 'static,
    {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers.write().insert(id, Arc::new(handler));
        id
    }

    pub fn remove_handler(&self, id: WatchId) -> bool {
        self.handlers.write().remove(&id).is_some()
    }

    /// Classify `signal`. Returns the change if the status moved.
    pub fn report(&self, signal: NetworkSignal) -> Option<NetworkChange> {
        let current = NetworkStatus {
            online: signal.online,
            slow: signal.is_slow(),
        };

        let change = {
            let mut status = self.status.write();
            if *status == current {
                return None;
            }
            let previous = std::mem::replace(&mut *status, current);
            NetworkChange { previous, current }
        };

        if change.came_online() {
            info!("network back online");
        } else if change.went_offline() {
            info!("network offline");
        }
        if change.speed_changed() {
            debug!(
                slow = current.slow,
                effective_type = signal.effective_type.as_deref().unwrap_or("unknown"),
                downlink_mbps = signal.downlink_mbps.unwrap_or(f64::NAN),
                "link quality changed"
            );
        }

        let handlers: Vec<ChangeHandler> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(&change);
        }
        Some(change)
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_slow_classification() {
        assert!(NetworkSignal::online().with_effective_type("2g").is_slow());
        assert!(NetworkSignal::online().with_effective_type("slow-2g").is_slow());
        assert!(NetworkSignal::online().with_effective_type("3g").is_slow());
        assert!(!NetworkSignal::online().with_effective_type("4g").is_slow());
        assert!(NetworkSignal::online().with_downlink(1.2).is_slow());
        assert!(!NetworkSignal::online().with_downlink(1.5).is_slow());
        assert!(!NetworkSignal::online().is_slow());
        assert!(!NetworkSignal::offline().with_effective_type("2g").is_slow());
    }

    #[test]
    fn test_handlers_see_only_transitions() {
        let monitor = NetworkMonitor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_change(move |change| sink.lock().push(*change));

        assert!(monitor.report(NetworkSignal::online()).is_none());
        let change = monitor.report(NetworkSignal::offline()).unwrap();
        assert!(change.went_offline());
        assert!(monitor.report(NetworkSignal::offline()).is_none());
        let change = monitor
            .report(NetworkSignal::online().with_effective_type("3g"))
            .unwrap();
        assert!(change.came_online());
        assert!(change.speed_changed());

        assert_eq!(seen.lock().len(), 2);
        assert!(monitor.is_online());
        assert!(monitor.is_slow_connection());
    }

    #[test]
    fn test_removed_handler_is_not_called() {
        let monitor = NetworkMonitor::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let id = monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.remove_handler(id));
        monitor.report(NetworkSignal::offline());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
