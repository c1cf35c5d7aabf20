//! Request and failure counters for cluster calls.
//!
//! The backend increments `backend_requests` around every call to the
//! cluster API and `backend_failures` for every failed call. Export to a
//! metrics sink is the embedding server's concern; this module only owns the
//! counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters, one instance per backend.
#[derive(Debug, Default)]
pub struct BackendMetrics {
    requests: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub failures: u64,
}

impl BackendMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one cluster API request.
    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one failed cluster API request.
    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = BackendMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 0);
        assert_eq!(snap.failures, 0);
    }

    #[test]
    fn test_metrics_increment() {
        let metrics = BackendMetrics::new();
        metrics.request();
        metrics.request();
        metrics.request();
        metrics.failure();
        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.failures, 1);
    }

    #[test]
    fn test_metrics_shared_across_threads() {
        let metrics = std::sync::Arc::new(BackendMetrics::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = std::sync::Arc::clone(&metrics);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.request();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().requests, 400);
    }
}
