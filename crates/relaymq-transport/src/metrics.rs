//! Connection pool metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of a pool's counters and current population.
pub struct PoolStats {
    /// Connector name of the pool's factory.
    pub connector: String,
    /// Outbound connections currently pooled.
    pub outbound_connections: usize,
    /// Inbound (accepted) connections currently pooled.
    pub accepted_connections: usize,
    /// Acceptors currently listening.
    pub acceptors: usize,
    /// Leases outstanding across all outbound connections.
    pub active_leases: usize,
    /// Outbound connections created over the pool's lifetime.
    pub connections_created: u64,
    /// Inbound connections accepted over the pool's lifetime.
    pub connections_accepted: u64,
    /// Connections destroyed for any reason.
    pub connections_destroyed: u64,
    /// Connections destroyed by the idle reaper.
    pub idle_reaped: u64,
    /// Connections destroyed by the dead reaper.
    pub dead_reaped: u64,
    /// Liveness probes sent.
    pub pings_sent: u64,
    /// Connections discarded because handler or listener registration failed.
    pub setup_failures: u64,
    /// Acceptors created over the pool's lifetime.
    pub acceptors_created: u64,
}

/// Thread-safe pool counters.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    connections_created: AtomicU64,
    connections_accepted: AtomicU64,
    connections_destroyed: AtomicU64,
    idle_reaped: AtomicU64,
    dead_reaped: AtomicU64,
    pings_sent: AtomicU64,
    setup_failures: AtomicU64,
    acceptors_created: AtomicU64,
}

impl PoolMetrics {
    /// Creates a new PoolMetrics instance with all counters initialized to zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts outbound connections created.
    pub fn inc_connections_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts connections accepted.
    pub fn inc_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts connections destroyed.
    pub fn inc_connections_destroyed(&self) {
        self.connections_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts connections reaped while idle.
    pub fn inc_idle_reaped(&self) {
        self.idle_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts connections reaped as dead.
    pub fn inc_dead_reaped(&self) {
        self.dead_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts pings sent.
    pub fn inc_pings_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts connections discarded during setup.
    pub fn inc_setup_failures(&self) {
        self.setup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts acceptors created.
    pub fn inc_acceptors_created(&self) {
        self.acceptors_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Fills the counter fields of `stats`.
    pub fn fill(&self, stats: &mut PoolStats) {
        stats.connections_created = self.connections_created.load(Ordering::Relaxed);
        stats.connections_accepted = self.connections_accepted.load(Ordering::Relaxed);
        stats.connections_destroyed = self.connections_destroyed.load(Ordering::Relaxed);
        stats.idle_reaped = self.idle_reaped.load(Ordering::Relaxed);
        stats.dead_reaped = self.dead_reaped.load(Ordering::Relaxed);
        stats.pings_sent = self.pings_sent.load(Ordering::Relaxed);
        stats.setup_failures = self.setup_failures.load(Ordering::Relaxed);
        stats.acceptors_created = self.acceptors_created.load(Ordering::Relaxed);
    }
}
