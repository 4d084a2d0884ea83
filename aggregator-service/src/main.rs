use aggregator_service::{
    api, config::AppConfig, metrics_server, observability, pipeline::Pipeline,
    sinks::AggregatorSink, sources::HttpJsonSource, transform::DeviceReadingValidation,
};
use anyhow::Result;
use meter_client::domain::DeviceReading;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    if cfg.metrics_enabled() {
        metrics_server::init()?;
    }

    let aggregator = Arc::new(cfg.build_aggregator()?);

    // Query API shares the aggregator with the ingest pipeline.
    let _api = api::spawn(&cfg.api.bind_addr, aggregator.clone())?;

    let source = HttpJsonSource::new(
        &cfg.source.http_bind_addr,
        cfg.source.channel_capacity,
        cfg.source.max_request_records,
    )
    .await?;
    let sink = AggregatorSink::new(
        aggregator,
        cfg.sink.workers,
        cfg.source.channel_capacity,
    );
    let validation = DeviceReadingValidation::new(cfg.aggregator.utc_offset);

    let pipeline: Pipeline<_, DeviceReading, _> =
        Pipeline::new("device_readings", source, sink).with_transform(Arc::new(validation));

    pipeline.run().await?;

    Ok(())
}
