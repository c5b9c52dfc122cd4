//! Gateway metrics for monitoring operations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for gateway operations.
#[derive(Default)]
pub struct GatewayMetrics {
    // Tool call metrics
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,

    // Script metrics
    scripts_executed: AtomicU64,
    scripts_failed: AtomicU64,

    // Connection metrics
    connections_opened: AtomicU64,
    connections_failed: AtomicU64,
    open_sessions: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, success: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_script(&self, success: bool) {
        self.scripts_executed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.scripts_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self) {
        self.open_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        let previous = self.open_sessions.fetch_sub(1, Ordering::Relaxed);
        if previous == 0 {
            // Underflow from an unmatched close; restore.
            self.open_sessions.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            scripts_executed: self.scripts_executed.load(Ordering::Relaxed),
            scripts_failed: self.scripts_failed.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            open_sessions: self.open_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the gateway counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub scripts_executed: u64,
    pub scripts_failed: u64,
    pub connections_opened: u64,
    pub connections_failed: u64,
    pub open_sessions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_counters() {
        let metrics = GatewayMetrics::new();
        metrics.record_call(true);
        metrics.record_call(true);
        metrics.record_call(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.successful_calls, 2);
        assert_eq!(snapshot.failed_calls, 1);
    }

    #[test]
    fn test_session_gauge_does_not_underflow() {
        let metrics = GatewayMetrics::new();
        metrics.record_session_closed();
        assert_eq!(metrics.snapshot().open_sessions, 0);

        metrics.record_session_opened();
        metrics.record_session_closed();
        assert_eq!(metrics.snapshot().open_sessions, 0);
    }

    #[test]
    fn test_script_counters() {
        let metrics = GatewayMetrics::new();
        metrics.record_script(true);
        metrics.record_script(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scripts_executed, 2);
        assert_eq!(snapshot.scripts_failed, 1);
    }
}
