use crate::seqno::Seqno;

/// Per-monitor ordering statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MonitorStats {
    /// Fraction of entries that happened out of order.
    pub oooe: f64,
    /// Fraction of leaves that happened out of order.
    pub oool: f64,
    /// Mean window between the frontier and the highest entered seqno.
    pub window: f64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Highest globally ordered position consumed by certification.
    pub position: Seqno,
    /// Highest seqno whose apply has fully finished.
    pub last_committed: Seqno,
    /// Mean distance between a write set and its snapshot horizon.
    pub cert_interval_avg: f64,
    /// Mean distance between a write set and its computed dependency.
    pub deps_dist_avg: f64,
    /// Live key entries in the certification index.
    pub cert_index_size: usize,
    /// Local receive-order monitor.
    pub local_monitor: MonitorStats,
    /// Parallel apply monitor.
    pub apply_monitor: MonitorStats,
    /// Commit-order monitor.
    pub commit_monitor: MonitorStats,
}
