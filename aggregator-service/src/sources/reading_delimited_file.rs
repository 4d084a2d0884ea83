use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use meter_client::domain::{DeviceReading, RawReading};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// Delimited-text backfill source for `DeviceReading` (CSV, or `|` for
/// `.dat` exports).
///
/// Expected header columns (by name):
/// - device_id
/// - timestamp (RFC3339 or naive local time)
/// - consumption_kwh (optional, cumulative)
/// - generation_kwh (optional, cumulative)
///
/// Empty or non-numeric channel cells are passed on as missing; the
/// aggregator decides whether the row is usable.
pub struct ReadingDelimitedFileSource {
    path: PathBuf,
    delimiter: u8,
}

impl ReadingDelimitedFileSource {
    pub fn csv<P: Into<PathBuf>>(path: P) -> Self {
        Self::with_delimiter(path, b',')
    }

    pub fn dat<P: Into<PathBuf>>(path: P) -> Self {
        Self::with_delimiter(path, b'|')
    }

    pub fn with_delimiter<P: Into<PathBuf>>(path: P, delimiter: u8) -> Self {
        Self {
            path: path.into(),
            delimiter,
        }
    }
}

fn parse_optional_f64(s: &str) -> Option<f64> {
    if s.trim().is_empty() {
        None
    } else {
        s.trim().parse().ok()
    }
}

fn record_to_device_reading(
    record: &StringRecord,
    headers: &StringRecord,
) -> Result<DeviceReading, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .ok_or_else(|| {
                PipelineError::Source(format!("missing column '{name}' in delimited record"))
            })
    };

    let device_id = get("device_id")?.trim().to_string();
    let timestamp = get("timestamp")?.trim().to_string();

    Ok(DeviceReading {
        device_id,
        reading: RawReading {
            consumption_kwh: get("consumption_kwh").ok().and_then(parse_optional_f64),
            generation_kwh: get("generation_kwh").ok().and_then(parse_optional_f64),
            timestamp: Some(timestamp),
        },
    })
}

#[async_trait::async_trait]
impl Source<DeviceReading> for ReadingDelimitedFileSource {
    async fn stream(&self) -> Result<EnvelopeStream<DeviceReading>, PipelineError> {
        // Blocking reader inside a single async task; fine for backfill sizes.
        let path = self.path.clone();
        let delimiter = self.delimiter;
        let s = async_stream::try_stream! {
            let file = File::open(&path)
                .map_err(|e| PipelineError::Source(format!("failed to open delimited file: {e}")))?;
            let mut rdr = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .flexible(true)
                .from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::Source(format!("failed to read headers: {e}")))?
                .clone();

            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::Source(format!(
                    "failed to read delimited record: {e}"
                )))?;

                let reading = match record_to_device_reading(&record, &headers) {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("delimited_reading_parse_errors_total").increment(1);
                        Err(e)?
                    }
                };

                yield Envelope::received_now(reading);
            }
        };

        Ok(Box::pin(s))
    }
}
