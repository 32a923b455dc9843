//! Engine observability counters.
//!
//! Every engine owns one [`ServerMetrics`] value and bumps its counters
//! with relaxed atomics on the hot path. [`ServerMetrics::snapshot`]
//! produces a plain read-only [`MetricsSnapshot`]; rendering (Prometheus
//! text, JSON, ...) is left to the caller.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters maintained by an engine and its collaborators.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub connections_accepted: AtomicU64,
    pub connections_closed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub requests_completed: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub handler_errors: AtomicU64,
    pub timeout_errors: AtomicU64,
    pub transport_errors: AtomicU64,
    pub rejected_tasks: AtomicU64,
    pub context_sweeps: AtomicU64,
    pub contexts_timed_out: AtomicU64,
}

impl ServerMetrics {
    pub fn inc_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_requests_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handler_errors(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeout_errors(&self) {
        self.timeout_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transport_errors(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_tasks(&self) {
        self.rejected_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Captures all counters plus the pool utilization of the moment.
    pub fn snapshot(&self, pool_utilization: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
            context_sweeps: self.context_sweeps.load(Ordering::Relaxed),
            contexts_timed_out: self.contexts_timed_out.load(Ordering::Relaxed),
            pool_utilization,
        }
    }
}

/// Read-only view of an engine's counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub requests_completed: u64,
    pub protocol_errors: u64,
    pub handler_errors: u64,
    pub timeout_errors: u64,
    pub transport_errors: u64,
    pub rejected_tasks: u64,
    pub context_sweeps: u64,
    pub contexts_timed_out: u64,
    pub pool_utilization: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = ServerMetrics::default();
        metrics.inc_connections_accepted();
        metrics.inc_connections_accepted();
        metrics.add_bytes_read(128);
        metrics.inc_requests_completed();

        let snapshot = metrics.snapshot(0.5);
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.bytes_read, 128);
        assert_eq!(snapshot.requests_completed, 1);
        assert_eq!(snapshot.pool_utilization, 0.5);
        assert_eq!(snapshot.connections_closed, 0);
    }
}
