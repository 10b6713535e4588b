//! Dispatch counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one dispatcher
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Records delivered (or captured by a dry-run target)
    records_sent: AtomicU64,
    /// Packets delivered
    packets_sent: AtomicU64,
    /// Failed send attempts
    packet_failures: AtomicU64,
    /// Records discarded by transforms
    records_dropped: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_sent(&self) -> u64 {
        self.records_sent.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packet_failures(&self) -> u64 {
        self.packet_failures.load(Ordering::Relaxed)
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_delivery(&self, records: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.records_sent.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_packet_failures(&self) {
        self.packet_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_records_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_sent: self.records_sent(),
            packets_sent: self.packets_sent(),
            packet_failures: self.packet_failures(),
            records_dropped: self.records_dropped(),
        }
    }
}

/// Point-in-time copy of [`DispatchStats`] (for reporting)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records_sent: u64,
    pub packets_sent: u64,
    pub packet_failures: u64,
    pub records_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = DispatchStats::new();
        stats.record_delivery(20);
        stats.record_delivery(5);
        stats.inc_packet_failures();
        stats.inc_records_dropped();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                records_sent: 25,
                packets_sent: 2,
                packet_failures: 1,
                records_dropped: 1,
            }
        );
    }
}
