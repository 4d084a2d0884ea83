use crate::pipeline::{Envelope, PipelineError, Transform};
use meter_client::domain::{parse_timestamp, DeviceReading};
use time::{macros::datetime, UtcOffset};

/// Pure validation of a `DeviceReading` record before aggregation.
///
/// Rules:
/// - device id is trimmed and must not be empty.
/// - a timestamp that parses must fall within [2000-01-01, 2100-01-01).
///
/// Unparsable timestamps and unusable channel values pass through; the
/// aggregator rejects those itself and reports them as an outcome.
pub fn validate_device_reading(
    mut env: Envelope<DeviceReading>,
    offset: UtcOffset,
) -> Result<Envelope<DeviceReading>, PipelineError> {
    let trimmed = env.payload.device_id.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Transform("device id must not be empty".to_string()));
    }
    if trimmed.len() != env.payload.device_id.len() {
        env.payload.device_id = trimmed.to_string();
    }

    if let Some(ts) = env.payload.reading.timestamp.as_deref() {
        if let Ok(ts) = parse_timestamp(ts, offset) {
            let min_ts = datetime!(2000-01-01 00:00:00 UTC);
            let max_ts = datetime!(2100-01-01 00:00:00 UTC);

            if ts < min_ts || ts >= max_ts {
                return Err(PipelineError::Transform(format!(
                    "timestamp out of allowed range for device '{}'",
                    env.payload.device_id
                )));
            }
        }
    }

    Ok(env)
}

#[derive(Clone)]
pub struct DeviceReadingValidation {
    offset: UtcOffset,
}

impl DeviceReadingValidation {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

#[async_trait::async_trait]
impl Transform<DeviceReading, DeviceReading> for DeviceReadingValidation {
    async fn apply(
        &self,
        input: Envelope<DeviceReading>,
    ) -> Result<Envelope<DeviceReading>, PipelineError> {
        match validate_device_reading(input, self.offset) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_device_reading_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}
