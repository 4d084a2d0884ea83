use std::{sync::Arc, time::SystemTime};

use futures::StreamExt;
use meter_client::domain::DeviceReading;
use tokio::sync::mpsc;

use crate::{
    aggregator::{Aggregator, UpdateOutcome},
    pipeline::{Envelope, PipelineError, Sink, SinkSummary},
};

fn shard_index(key: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};

    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

/// Feeds readings into an [`Aggregator`] from a pool of worker tasks.
///
/// Records are sharded by device id, so one device is always handled by the
/// same worker and its readings are applied in arrival order.
pub struct AggregatorSink {
    aggregator: Arc<Aggregator>,
    workers: usize,
    channel_capacity: usize,
}

impl AggregatorSink {
    pub fn new(aggregator: Arc<Aggregator>, workers: usize, channel_capacity: usize) -> Self {
        Self {
            aggregator,
            workers: workers.max(1),
            channel_capacity: channel_capacity.max(1),
        }
    }
}

async fn drain(
    aggregator: Arc<Aggregator>,
    mut rx: mpsc::Receiver<Envelope<DeviceReading>>,
) -> SinkSummary {
    let mut summary = SinkSummary::default();

    while let Some(env) = rx.recv().await {
        let DeviceReading { device_id, reading } = &env.payload;
        let outcome = aggregator.update(device_id, reading);

        if let UpdateOutcome::Rejected(reason) = &outcome {
            tracing::warn!(
                device_id = %device_id,
                reason = %reason,
                "reading rejected by aggregator"
            );
        }
        summary.record(outcome.as_str());

        if let Ok(dur) = SystemTime::now().duration_since(env.received_at) {
            metrics::histogram!("aggregate_end_to_end_latency_seconds").record(dur.as_secs_f64());
        }
    }

    summary
}

#[async_trait::async_trait]
impl Sink<DeviceReading> for AggregatorSink {
    async fn run<S>(&self, mut input: S) -> Result<SinkSummary, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<DeviceReading>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        let mut txs = Vec::with_capacity(self.workers);
        let mut joins = Vec::with_capacity(self.workers);

        for _ in 0..self.workers {
            let (tx, rx) = mpsc::channel::<Envelope<DeviceReading>>(self.channel_capacity);
            txs.push(tx);
            joins.push(tokio::spawn(drain(self.aggregator.clone(), rx)));
        }

        let mut summary = SinkSummary::default();

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "skipping record rejected upstream of AggregatorSink"
                    );
                    summary.upstream_errors += 1;
                    continue;
                }
            };

            let idx = shard_index(&env.payload.device_id, self.workers);
            if txs[idx].send(env).await.is_err() {
                return Err(PipelineError::Sink("aggregator worker channel closed".to_string()));
            }
        }

        drop(txs);

        for j in joins {
            match j.await {
                Ok(worker_summary) => summary.merge(worker_summary),
                Err(e) => {
                    return Err(PipelineError::Sink(format!(
                        "aggregator worker join error: {e}"
                    )))
                }
            }
        }

        Ok(summary)
    }
}
