use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Authoritative time source for expiry checks and notification timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Local wall clock shifted by an externally measured correction.
#[derive(Debug, Default)]
pub struct OffsetClock {
    offset_nanos: AtomicI64,
}

impl OffsetClock {
    pub fn new(offset_nanos: i64) -> Self {
        Self {
            offset_nanos: AtomicI64::new(offset_nanos),
        }
    }

    pub fn offset_nanos(&self) -> i64 {
        self.offset_nanos.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, offset_nanos: i64) {
        self.offset_nanos.store(offset_nanos, Ordering::Relaxed);
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::nanoseconds(self.offset_nanos())
    }
}

/// Clock pinned to a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    nanos: AtomicI64,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicI64::new(to_nanos(at)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.nanos.store(to_nanos(at), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let step = by.num_nanoseconds().unwrap_or(i64::MAX);
        self.nanos.fetch_add(step, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}
