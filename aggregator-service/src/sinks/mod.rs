pub mod aggregator;

pub use aggregator::AggregatorSink;
