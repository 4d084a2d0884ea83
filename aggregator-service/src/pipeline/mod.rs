use std::{collections::BTreeMap, pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn received_now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    /// Hands out the record stream. Single-consumer sources fail on a second call.
    async fn stream(&self) -> Result<EnvelopeStream<T>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<SinkSummary, PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// What a sink did with its input, keyed by outcome label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub upstream_errors: u64,
    pub outcomes: BTreeMap<&'static str, u64>,
}

impl SinkSummary {
    pub fn record(&mut self, outcome: &'static str) {
        *self.outcomes.entry(outcome).or_default() += 1;
    }

    pub fn count(&self, outcome: &str) -> u64 {
        self.outcomes.get(outcome).copied().unwrap_or(0)
    }

    pub fn processed(&self) -> u64 {
        self.outcomes.values().sum()
    }

    pub fn merge(&mut self, other: SinkSummary) {
        self.upstream_errors += other.upstream_errors;
        for (outcome, n) in other.outcomes {
            *self.outcomes.entry(outcome).or_default() += n;
        }
    }
}

pub struct Pipeline<S, T, K> {
    pub name: String,
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>, // same-type transforms chain
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, source: S, sink: K) -> Self {
        Self {
            name: name.into(),
            source,
            transforms: Vec::new(),
            sink,
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform<T, T> + Send + Sync>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub async fn run(self) -> Result<SinkSummary, PipelineError> {
        let mut stream = self.source.stream().await?;

        // Apply transforms in sequence (if any).
        for t in self.transforms {
            stream = Box::pin(stream.then(move |item| {
                let t_inner = t.clone();
                async move {
                    match item {
                        Ok(env) => t_inner.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            }));
        }

        let summary = self.sink.run(stream).await?;
        tracing::info!(
            pipeline = %self.name,
            processed = summary.processed(),
            upstream_errors = summary.upstream_errors,
            "pipeline finished"
        );

        Ok(summary)
    }
}
