//! Metrics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use wallcap_ipc::{CaptureMetrics, SessionMetrics, SessionState};

/// Collects engine-wide counters and aggregates per-session ones.
pub struct MetricsCollector {
    start_time: Instant,
    sessions_started: AtomicU64,
    sessions_failed: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sessions_started: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
        }
    }

    /// Record a session whose native stream started.
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session that failed to start.
    pub fn record_session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Sessions started since the engine was created.
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    /// Sessions that failed to start since the engine was created.
    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    /// Build a snapshot from the current sessions.
    pub fn snapshot<I>(&self, sessions: I) -> CaptureMetrics
    where
        I: IntoIterator<Item = (SessionState, SessionMetrics)>,
    {
        let mut snapshot = CaptureMetrics {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            ..Default::default()
        };

        for (state, metrics) in sessions {
            snapshot.session_count += 1;
            if state.is_running() {
                snapshot.running_sessions += 1;
            }
            snapshot.total_frames_delivered += metrics.frames_delivered;
            snapshot.total_frames_rejected += metrics.frames_rejected;
            snapshot.sessions.push(metrics);
        }

        snapshot
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
