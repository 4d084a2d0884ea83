use serde::{de::IgnoredAny, Deserialize, Deserializer, Serialize};
use time::{
    format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime,
    PrimitiveDateTime, UtcOffset,
};

/// A meter sample as delivered by the device telemetry endpoint.
///
/// Channel values are cumulative counters in kWh. Every field is optional on
/// the wire, numbers may arrive as JSON strings, and the instantaneous
/// electrical fields (`Consumption_V`, `Generation_P`, ...) are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    #[serde(rename = "Consumption_kWh", default, deserialize_with = "de_lenient_number")]
    pub consumption_kwh: Option<f64>,
    #[serde(rename = "Generation_kWh", default, deserialize_with = "de_lenient_number")]
    pub generation_kwh: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl RawReading {
    pub fn new(consumption_kwh: f64, generation_kwh: f64, timestamp: impl Into<String>) -> Self {
        Self {
            consumption_kwh: Some(consumption_kwh),
            generation_kwh: Some(generation_kwh),
            timestamp: Some(timestamp.into()),
        }
    }
}

/// One record of the telemetry feed: a device id and its latest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    pub device_id: String,
    #[serde(rename = "payload")]
    pub reading: RawReading,
}

fn de_lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
        Other(IgnoredAny),
    }

    Ok(match Option::<NumberOrText>::deserialize(deserializer)? {
        Some(NumberOrText::Number(v)) => Some(v),
        Some(NumberOrText::Text(s)) => s.trim().parse().ok(),
        Some(NumberOrText::Other(_)) | None => None,
    })
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadingError {
    #[error("reading has no timestamp")]
    MissingTimestamp,
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("timestamp '{0}' is outside the supported years 1..=9998")]
    TimestampOutOfRange(String),
    #[error("reading has no usable consumption or generation value")]
    NoUsableChannel,
}

/// A validated sample: a parsed instant and at least one usable channel.
///
/// A channel is `None` when the wire value was missing, negative or not a
/// finite number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub consumed: Option<f64>,
    pub generated: Option<f64>,
    pub timestamp: OffsetDateTime,
}

impl Reading {
    /// Validates a raw sample. Naive timestamps are read in `offset`.
    pub fn parse(raw: &RawReading, offset: UtcOffset) -> Result<Self, ReadingError> {
        let ts = raw.timestamp.as_deref().ok_or(ReadingError::MissingTimestamp)?;
        let timestamp = parse_timestamp(ts, offset)?;

        let consumed = usable(raw.consumption_kwh);
        let generated = usable(raw.generation_kwh);
        if consumed.is_none() && generated.is_none() {
            return Err(ReadingError::NoUsableChannel);
        }

        Ok(Self {
            consumed,
            generated,
            timestamp,
        })
    }

    /// Channel values with missing ones carried forward from `previous`
    /// (`(consumed, generated)`), or zero when there is nothing to carry.
    pub fn resolve(&self, previous: Option<(f64, f64)>) -> (f64, f64) {
        let (prev_consumed, prev_generated) = previous.unwrap_or((0.0, 0.0));
        (
            self.consumed.unwrap_or(prev_consumed),
            self.generated.unwrap_or(prev_generated),
        )
    }
}

fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Parses an RFC 3339 timestamp, or a naive `YYYY-MM-DD HH:MM:SS[.fff]`
/// (space or `T` separated) local time interpreted at `offset`.
///
/// Years outside `1..=9998` are refused so the instant can be moved to any
/// offset without leaving the representable range.
pub fn parse_timestamp(s: &str, offset: UtcOffset) -> Result<OffsetDateTime, ReadingError> {
    let s = s.trim();
    let ts = match OffsetDateTime::parse(s, &Rfc3339) {
        Ok(ts) => ts,
        Err(_) => parse_naive(s)
            .map(|naive| naive.assume_offset(offset))
            .ok_or_else(|| ReadingError::InvalidTimestamp(s.to_string()))?,
    };

    if !(1..=9998).contains(&ts.year()) {
        return Err(ReadingError::TimestampOutOfRange(s.to_string()));
    }

    Ok(ts)
}

fn parse_naive(s: &str) -> Option<PrimitiveDateTime> {
    let space = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let t_sep = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let space_frac =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
    let t_sep_frac =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");

    [space, t_sep, space_frac, t_sep_frac]
        .into_iter()
        .find_map(|format| PrimitiveDateTime::parse(s, format).ok())
}
