//! Bridge statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Why an uplink was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TooShort,
    NotWhitelisted,
    Disabled,
    NoData,
}

/// Bridge counters, updated from every worker.
#[derive(Debug)]
pub struct BridgeStats {
    /// Uplinks delivered by the broker.
    pub uplinks_received: AtomicU64,

    /// Uplinks sent to the ingestion service.
    pub uplinks_forwarded: AtomicU64,

    /// Bytes sent to the ingestion service.
    pub bytes_forwarded: AtomicU64,

    pub dropped_too_short: AtomicU64,
    pub dropped_not_whitelisted: AtomicU64,
    pub dropped_disabled: AtomicU64,
    pub dropped_no_data: AtomicU64,

    /// Uplinks aborted by a directory, pool or send failure.
    pub uplink_errors: AtomicU64,

    pub downlinks_published: AtomicU64,
    pub downlink_errors: AtomicU64,

    pub started: Instant,
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            uplinks_received: AtomicU64::new(0),
            uplinks_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            dropped_too_short: AtomicU64::new(0),
            dropped_not_whitelisted: AtomicU64::new(0),
            dropped_disabled: AtomicU64::new(0),
            dropped_no_data: AtomicU64::new(0),
            uplink_errors: AtomicU64::new(0),
            downlinks_published: AtomicU64::new(0),
            downlink_errors: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_received(&self) {
        self.uplinks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, bytes: usize) {
        self.uplinks_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::TooShort => &self.dropped_too_short,
            DropReason::NotWhitelisted => &self.dropped_not_whitelisted,
            DropReason::Disabled => &self.dropped_disabled,
            DropReason::NoData => &self.dropped_no_data,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uplink_error(&self) {
        self.uplink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downlink(&self) {
        self.downlinks_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downlink_error(&self) {
        self.downlink_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            uplinks_received: self.uplinks_received.load(Ordering::Relaxed),
            uplinks_forwarded: self.uplinks_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            uplinks_dropped: self.dropped_too_short.load(Ordering::Relaxed)
                + self.dropped_not_whitelisted.load(Ordering::Relaxed)
                + self.dropped_disabled.load(Ordering::Relaxed)
                + self.dropped_no_data.load(Ordering::Relaxed),
            uplink_errors: self.uplink_errors.load(Ordering::Relaxed),
            downlinks_published: self.downlinks_published.load(Ordering::Relaxed),
            downlink_errors: self.downlink_errors.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Plain copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStatsSnapshot {
    pub uplinks_received: u64,
    pub uplinks_forwarded: u64,
    pub bytes_forwarded: u64,
    pub uplinks_dropped: u64,
    pub uplink_errors: u64,
    pub downlinks_published: u64,
    pub downlink_errors: u64,
    pub uptime_secs: u64,
}

impl BridgeStatsSnapshot {
    pub fn uplinks_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.uplinks_forwarded as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for BridgeStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "up: {} received, {} forwarded ({} bytes), {} dropped, {} errors | down: {} published, {} errors | {:.2} msg/s",
            self.uplinks_received,
            self.uplinks_forwarded,
            self.bytes_forwarded,
            self.uplinks_dropped,
            self.uplink_errors,
            self.downlinks_published,
            self.downlink_errors,
            self.uplinks_per_second()
        )
    }
}
