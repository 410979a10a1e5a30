use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use crate::model::Ms;

/// Asia/Shanghai is UTC+08:00 year-round (no DST since 1991).
pub const ZONE_OFFSET_MS: Ms = 8 * 3_600_000;

pub const DAY_MS: Ms = 86_400_000;

/// Source of "now". Every time-dependent decision in the engine goes through this.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// Local (Asia/Shanghai) wall time of an instant.
pub fn local_datetime(ms: Ms) -> NaiveDateTime {
    DateTime::from_timestamp_millis(ms + ZONE_OFFSET_MS)
        .unwrap_or_default()
        .naive_utc()
}

/// Local calendar day of an instant.
pub fn local_date(ms: Ms) -> NaiveDate {
    local_datetime(ms).date()
}

/// Today's local calendar day according to `clock`.
pub fn today(clock: &dyn Clock) -> NaiveDate {
    local_date(clock.now_ms())
}

/// Instant of a local wall time.
pub fn local_ms(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis() - ZONE_OFFSET_MS
}

/// Parse an instant from text: an RFC 3339 timestamp with offset, or a naive
/// `YYYY-MM-DD HH:MM[:SS]` / `YYYY-MM-DDTHH:MM[:SS]` in local time.
pub fn parse_local_instant(s: &str) -> Option<Ms> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|naive| naive.and_utc().timestamp_millis() - ZONE_OFFSET_MS)
}
