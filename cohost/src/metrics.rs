//! Device counters.
//!
//! Counters only ever increase. Callers that want rates take two snapshots
//! and subtract.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counter storage owned by the device.
#[derive(Debug, Default)]
pub struct DeviceMetricsStorage {
    instances_created: AtomicU64,
    instances_destroyed: AtomicU64,
    boots_issued: AtomicU64,
    boot_failures: AtomicU64,
    shutdowns: AtomicU64,
    allocation_failures: AtomicU64,
    busy_rejections: AtomicU64,
}

impl DeviceMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_instances_created(&self) {
        self.instances_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_instances_destroyed(&self) {
        self.instances_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_boots_issued(&self) {
        self.boots_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Wakes the interrupt controller did not accept.
    pub fn increment_boot_failures(&self) {
        self.boot_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_shutdowns(&self) {
        self.shutdowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_allocation_failures(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_busy_rejections(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeviceMetrics {
        DeviceMetrics {
            instances_created: self.instances_created.load(Ordering::Relaxed),
            instances_destroyed: self.instances_destroyed.load(Ordering::Relaxed),
            boots_issued: self.boots_issued.load(Ordering::Relaxed),
            boot_failures: self.boot_failures.load(Ordering::Relaxed),
            shutdowns: self.shutdowns.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeviceMetricsStorage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceMetrics {
    pub instances_created: u64,
    pub instances_destroyed: u64,
    pub boots_issued: u64,
    pub boot_failures: u64,
    pub shutdowns: u64,
    pub allocation_failures: u64,
    pub busy_rejections: u64,
}

impl DeviceMetrics {
    /// Instances currently known to the device.
    pub fn live_instances(&self) -> u64 {
        self.instances_created.saturating_sub(self.instances_destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let storage = DeviceMetricsStorage::new();
        storage.increment_instances_created();
        storage.increment_instances_created();
        storage.increment_instances_destroyed();
        storage.increment_busy_rejections();

        let snap = storage.snapshot();
        assert_eq!(snap.instances_created, 2);
        assert_eq!(snap.live_instances(), 1);
        assert_eq!(snap.busy_rejections, 1);
        assert_eq!(snap.boots_issued, 0);
    }
}
