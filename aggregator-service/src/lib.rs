pub mod aggregator;
pub mod api;
pub mod config;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use aggregator::{Aggregator, AggregatorConfig, UpdateOutcome};
pub use pipeline::{Envelope, Pipeline};
