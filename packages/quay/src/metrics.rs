//! Gateway metrics for observability.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide counters, updated lock-free from every connection task.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Currently attached transports.
    pub active_connections: AtomicU64,
    /// Total upgrades accepted since start.
    pub total_connections: AtomicU64,

    /// Sessions created (fresh tokens, client-chosen or generated).
    pub sessions_created: AtomicU64,
    /// Successful resumptions, explicit or implicit.
    pub sessions_resumed: AtomicU64,
    /// Sessions destroyed after the grace window elapsed.
    pub sessions_evicted: AtomicU64,
    /// Rejected resolves (unknown token or duplicate connect).
    pub session_conflicts: AtomicU64,

    /// Frames received from clients.
    pub frames_received: AtomicU64,
    /// Frames sent or buffered toward clients.
    pub frames_sent: AtomicU64,
    /// Frames lost to outbox overflow while sessions were parked.
    pub frames_dropped: AtomicU64,

    start_time: Option<Instant>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_resumed(&self) {
        self.sessions_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_evicted(&self, count: u64) {
        self.sessions_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn session_conflict(&self) {
        self.session_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Snapshot for logging at shutdown.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionCounters {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            sessions: SessionCounters {
                created: self.sessions_created.load(Ordering::Relaxed),
                resumed: self.sessions_resumed.load(Ordering::Relaxed),
                evicted: self.sessions_evicted.load(Ordering::Relaxed),
                conflicts: self.session_conflicts.load(Ordering::Relaxed),
            },
            frames: FrameCounters {
                received: self.frames_received.load(Ordering::Relaxed),
                sent: self.frames_sent.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of all counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionCounters,
    pub sessions: SessionCounters,
    pub frames: FrameCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCounters {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCounters {
    pub created: u64,
    pub resumed: u64,
    pub evicted: u64,
    pub conflicts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameCounters {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}
