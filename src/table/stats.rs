//! Per-operation counters and timers.
//!
//! Live counts are kept in atomics so the hot paths never take a lock;
//! `snapshot()` materializes a plain `Stat` value and `Stat::diff` turns two
//! snapshots into an interval report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// A count plus accumulated wall time for one operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpStat {
    pub count: u64,
    pub duration: Duration,
}

impl OpStat {
    fn diff(&self, other: &OpStat) -> OpStat {
        OpStat {
            count: self.count.saturating_sub(other.count),
            duration: self.duration.saturating_sub(other.duration),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct OpCell {
    count: AtomicU64,
    nanos: AtomicU64,
}

impl OpCell {
    pub fn record(&self, started: Instant) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OpStat {
        OpStat {
            count: self.count.load(Ordering::Relaxed),
            duration: Duration::from_nanos(self.nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot of all per-operation statistics for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub fetch: OpStat,
    pub insert: OpStat,
    pub delete: OpStat,
    pub factorize_cache_hits: u64,
    pub factorize_fetch_hit: OpStat,
    pub factorize_fetch_miss: OpStat,
    pub factorize_create: OpStat,
    pub defactorize_cache_hits: u64,
    pub defactorize_fetch_hit: OpStat,
    pub defactorize_fetch_miss: OpStat,
    pub marshal: OpStat,
    pub unmarshal: OpStat,
}

impl Stat {
    /// Component-wise difference, for interval reporting.
    pub fn diff(&self, other: &Stat) -> Stat {
        Stat {
            fetch: self.fetch.diff(&other.fetch),
            insert: self.insert.diff(&other.insert),
            delete: self.delete.diff(&other.delete),
            factorize_cache_hits: self
                .factorize_cache_hits
                .saturating_sub(other.factorize_cache_hits),
            factorize_fetch_hit: self.factorize_fetch_hit.diff(&other.factorize_fetch_hit),
            factorize_fetch_miss: self.factorize_fetch_miss.diff(&other.factorize_fetch_miss),
            factorize_create: self.factorize_create.diff(&other.factorize_create),
            defactorize_cache_hits: self
                .defactorize_cache_hits
                .saturating_sub(other.defactorize_cache_hits),
            defactorize_fetch_hit: self.defactorize_fetch_hit.diff(&other.defactorize_fetch_hit),
            defactorize_fetch_miss: self
                .defactorize_fetch_miss
                .diff(&other.defactorize_fetch_miss),
            marshal: self.marshal.diff(&other.marshal),
            unmarshal: self.unmarshal.diff(&other.unmarshal),
        }
    }
}

/// Live statistics registry owned by a table.
#[derive(Debug, Default)]
pub(crate) struct TableStatistics {
    pub fetch: OpCell,
    pub insert: OpCell,
    pub delete: OpCell,
    pub factorize_cache_hits: AtomicU64,
    pub factorize_fetch_hit: OpCell,
    pub factorize_fetch_miss: OpCell,
    pub factorize_create: OpCell,
    pub defactorize_cache_hits: AtomicU64,
    pub defactorize_fetch_hit: OpCell,
    pub defactorize_fetch_miss: OpCell,
    pub marshal: OpCell,
    pub unmarshal: OpCell,
}

impl TableStatistics {
    pub fn snapshot(&self) -> Stat {
        Stat {
            fetch: self.fetch.snapshot(),
            insert: self.insert.snapshot(),
            delete: self.delete.snapshot(),
            factorize_cache_hits: self.factorize_cache_hits.load(Ordering::Relaxed),
            factorize_fetch_hit: self.factorize_fetch_hit.snapshot(),
            factorize_fetch_miss: self.factorize_fetch_miss.snapshot(),
            factorize_create: self.factorize_create.snapshot(),
            defactorize_cache_hits: self.defactorize_cache_hits.load(Ordering::Relaxed),
            defactorize_fetch_hit: self.defactorize_fetch_hit.snapshot(),
            defactorize_fetch_miss: self.defactorize_fetch_miss.snapshot(),
            marshal: self.marshal.snapshot(),
            unmarshal: self.unmarshal.snapshot(),
        }
    }
}

/// Aggregate storage measures over a set of partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Number of partitions aggregated.
    pub partitions: usize,
    /// Approximate total key count.
    pub keys: u64,
    /// Total on-disk segment size in bytes.
    pub disk_space: u64,
}
