use aggregator_service::{
    config::AppConfig,
    observability,
    pipeline::{EnvelopeStream, Pipeline, PipelineError, Source},
    sinks::AggregatorSink,
    sources::{ReadingBackfillFileSource, ReadingDelimitedFileSource},
    transform::DeviceReadingValidation,
};
use anyhow::{bail, Result};
use meter_client::domain::DeviceReading;
use std::{env, path::Path, sync::Arc};

/// Replays a reading file through the aggregator and logs the resulting
/// totals per device.
///
/// Usage:
///   backfill_readings <file> [--delimiter <char>]
///
/// `.ndjson`/`.jsonl`/`.json` files are read as JSON records; anything else
/// as delimited text (`,` by default, `|` for `.dat`).
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_readings <file> [--delimiter <char>]");
    }
    let file_path = &args[1];

    let delimiter = match args.get(2).map(String::as_str) {
        None => None,
        Some("--delimiter") => match args.get(3).map(|d| d.as_bytes()) {
            Some([d]) => Some(*d),
            _ => bail!("--delimiter expects a single ASCII character"),
        },
        Some(other) => bail!("unexpected argument '{other}'"),
    };

    // AGGREGATOR_CONFIG can point to a backfill-specific file.
    let cfg = AppConfig::load()?;
    let aggregator = Arc::new(cfg.build_aggregator()?);

    let source = source_for(Path::new(file_path), delimiter);
    let sink = AggregatorSink::new(
        aggregator.clone(),
        cfg.sink.workers,
        cfg.source.channel_capacity,
    );
    let validation = DeviceReadingValidation::new(cfg.aggregator.utc_offset);

    let pipeline: Pipeline<_, DeviceReading, _> =
        Pipeline::new("backfill_readings", source, sink).with_transform(Arc::new(validation));

    let summary = pipeline.run().await?;
    for (outcome, count) in &summary.outcomes {
        tracing::info!(outcome, count, "backfill outcome");
    }

    // Replayed days are usually in the past, so report each device's own day.
    for device_id in aggregator.devices() {
        let Some(report) = aggregator.report(&device_id) else {
            continue;
        };
        tracing::info!(
            device_id = %device_id,
            accounting_day = %report.accounting_day,
            total_imported = report.totals.total_imported,
            total_exported = report.totals.total_exported,
            instant_net = report.totals.instant_net,
            consumed = report.usage.consumed,
            generated = report.usage.generated,
            "device totals"
        );
    }

    Ok(())
}

enum ReadingFileSource {
    Json(ReadingBackfillFileSource),
    Delimited(ReadingDelimitedFileSource),
}

fn source_for(path: &Path, delimiter: Option<u8>) -> ReadingFileSource {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match (ext.as_deref(), delimiter) {
        (_, Some(d)) => {
            ReadingFileSource::Delimited(ReadingDelimitedFileSource::with_delimiter(path, d))
        }
        (Some("ndjson" | "jsonl" | "json"), None) => {
            ReadingFileSource::Json(ReadingBackfillFileSource::new(path))
        }
        (Some("dat"), None) => ReadingFileSource::Delimited(ReadingDelimitedFileSource::dat(path)),
        _ => ReadingFileSource::Delimited(ReadingDelimitedFileSource::csv(path)),
    }
}

#[async_trait::async_trait]
impl Source<DeviceReading> for ReadingFileSource {
    async fn stream(&self) -> Result<EnvelopeStream<DeviceReading>, PipelineError> {
        match self {
            Self::Json(s) => s.stream().await,
            Self::Delimited(s) => s.stream().await,
        }
    }
}
