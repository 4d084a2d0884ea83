use std::path::PathBuf;

use async_stream::try_stream;
use meter_client::domain::DeviceReading;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// A simple NDJSON backfill source for `DeviceReading`.
///
/// Each line in the file is expected to be a JSON object with the same shape
/// as the HTTP ingestion payload (`deviceId`, `payload`). Blank lines are
/// skipped; a malformed line ends the stream with an error.
pub struct ReadingBackfillFileSource {
    path: PathBuf,
}

impl ReadingBackfillFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Source<DeviceReading> for ReadingBackfillFileSource {
    async fn stream(&self) -> Result<EnvelopeStream<DeviceReading>, PipelineError> {
        let path = self.path.clone();
        let s = try_stream! {
            let file = File::open(&path).await.map_err(|e| {
                PipelineError::Source(format!("failed to open backfill file: {e}"))
            })?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();
            let mut line_no: usize = 0;

            while let Some(line) = lines.next_line().await.map_err(|e| {
                PipelineError::Source(format!("failed to read backfill line: {e}"))
            })? {
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                let record: DeviceReading = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        metrics::counter!("backfill_reading_parse_errors_total").increment(1);
                        Err(PipelineError::Source(format!(
                            "failed to parse backfill json line {line_no}: {e}"
                        )))?
                    }
                };

                yield Envelope::received_now(record);
            }
        };

        Ok(Box::pin(s))
    }
}
