use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operation counters. Background workers count swallowed errors here so
/// they stay observable.
#[derive(Debug, Default)]
pub struct Meter {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub deletes: AtomicU64,
    pub syncs: AtomicU64,
    pub recoveries: AtomicU64,
    pub expired: AtomicU64,
    pub in_msgs: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
    pub errors: AtomicU64,
}

impl Meter {
    pub fn inc(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of the database's counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Varz {
    pub seq: u64,
    pub count: u64,
    pub mem_size: i64,
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub syncs: u64,
    pub recoveries: u64,
    pub expired: u64,
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub errors: u64,
}

impl Varz {
    pub fn snapshot(meter: &Meter, seq: u64, count: u64, mem_size: i64) -> Self {
        Self {
            seq,
            count,
            mem_size,
            puts: meter.puts.load(Ordering::Relaxed),
            gets: meter.gets.load(Ordering::Relaxed),
            deletes: meter.deletes.load(Ordering::Relaxed),
            syncs: meter.syncs.load(Ordering::Relaxed),
            recoveries: meter.recoveries.load(Ordering::Relaxed),
            expired: meter.expired.load(Ordering::Relaxed),
            in_msgs: meter.in_msgs.load(Ordering::Relaxed),
            in_bytes: meter.in_bytes.load(Ordering::Relaxed),
            out_bytes: meter.out_bytes.load(Ordering::Relaxed),
            errors: meter.errors.load(Ordering::Relaxed),
        }
    }
}
