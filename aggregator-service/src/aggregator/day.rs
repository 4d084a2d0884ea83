use meter_client::domain::DayKey;
use time::{OffsetDateTime, UtcOffset};

/// Maps an instant to the accounting day it belongs to.
///
/// Closures `Fn(OffsetDateTime) -> DayKey` implement this, which keeps
/// boundary tests free of wall-clock and time-zone setup.
pub trait DayBoundary: Send + Sync {
    fn day_key(&self, instant: OffsetDateTime) -> DayKey;
}

impl<F> DayBoundary for F
where
    F: Fn(OffsetDateTime) -> DayKey + Send + Sync,
{
    fn day_key(&self, instant: OffsetDateTime) -> DayKey {
        self(instant)
    }
}

/// Calendar day at a fixed UTC offset (no DST).
///
/// An instant that cannot be expressed at the offset (the last hours of year
/// 9999) keeps the date of its own offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedOffsetDay(pub UtcOffset);

impl DayBoundary for FixedOffsetDay {
    fn day_key(&self, instant: OffsetDateTime) -> DayKey {
        instant
            .checked_to_offset(self.0)
            .map_or_else(|| instant.date(), |local| local.date())
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

impl<F> Clock for F
where
    F: Fn() -> OffsetDateTime + Send + Sync,
{
    fn now(&self) -> OffsetDateTime {
        self()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
