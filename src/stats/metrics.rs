//! Connection counters for the server

use std::sync::atomic::{AtomicU64, Ordering};

/// Server-wide connection counters
///
/// Updated from the listener (admission) and the per-client tasks
/// (teardown), so all fields are atomics.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
}

/// Point-in-time copy of the server counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Total connections ever admitted
    pub total_connections: u64,
    /// Connections currently live
    pub active_connections: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the current counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_counting() {
        let stats = ServerStats::new();

        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
    }

    #[test]
    fn test_snapshot_is_copy() {
        let stats = ServerStats::new();
        stats.connection_opened();

        let a = stats.snapshot();
        stats.connection_closed();
        let b = stats.snapshot();

        assert_eq!(a.active_connections, 1);
        assert_eq!(b.active_connections, 0);
        assert_eq!(a.total_connections, b.total_connections);
    }
}
