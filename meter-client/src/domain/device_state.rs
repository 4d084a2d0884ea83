use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::domain::{DailyUsage, Totals};

/// Calendar day in the reference time zone.
pub type DayKey = Date;

/// Running accounting state for one device during one accounting day.
///
/// `baseline_*` are the cumulative counters at the start of the day (or at
/// the last meter reset), `prev_*` the counters of the last accepted reading.
/// `settled_*` hold per-channel energy counted against baselines that a meter
/// reset later discarded, so "since midnight" usage survives the reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub baseline_consumed: f64,
    pub baseline_generated: f64,
    pub prev_consumed: f64,
    pub prev_generated: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub prev_timestamp: OffsetDateTime,
    pub total_imported: f64,
    pub total_exported: f64,
    #[serde(default)]
    pub settled_consumed: f64,
    #[serde(default)]
    pub settled_generated: f64,
    pub accounting_day: DayKey,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

impl DeviceState {
    /// Fresh state for `day`, seeded from the first reading of that day.
    pub fn seed(
        consumed: f64,
        generated: f64,
        timestamp: OffsetDateTime,
        day: DayKey,
        processed_at: OffsetDateTime,
    ) -> Self {
        Self {
            baseline_consumed: consumed,
            baseline_generated: generated,
            prev_consumed: consumed,
            prev_generated: generated,
            prev_timestamp: timestamp,
            total_imported: 0.0,
            total_exported: 0.0,
            settled_consumed: 0.0,
            settled_generated: 0.0,
            accounting_day: day,
            processed_at,
        }
    }

    /// Resynchronizes baselines after a meter reset. Totals are untouched.
    pub fn reseed(&mut self, consumed: f64, generated: f64, timestamp: OffsetDateTime) {
        self.settled_consumed += self.prev_consumed - self.baseline_consumed;
        self.settled_generated += self.prev_generated - self.baseline_generated;
        self.baseline_consumed = consumed;
        self.baseline_generated = generated;
        self.prev_consumed = consumed;
        self.prev_generated = generated;
        self.prev_timestamp = timestamp;
    }

    pub fn totals(&self) -> Totals {
        Totals {
            total_imported: self.total_imported,
            total_exported: self.total_exported,
            instant_net: self.prev_generated - self.prev_consumed,
        }
    }

    pub fn daily_usage(&self) -> DailyUsage {
        DailyUsage {
            consumed: self.settled_consumed + (self.prev_consumed - self.baseline_consumed),
            generated: self.settled_generated + (self.prev_generated - self.baseline_generated),
        }
    }
}
