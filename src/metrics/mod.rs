mod analyzer;
mod collector;
mod schema;
mod source;
mod types;

pub use analyzer::{Analysis, DataAnalyzer};
pub use collector::{Collector, CollectorHandle, CollectorOptions, RoundOutcome};
pub use schema::{MetricGroup, MetricKind, MetricSchema, MetricSpec, TimeUnit};
pub use source::{CollectionError, MetricSource, ReplaySource};
pub(crate) use types::split_metric_name;
pub use types::{
    AnalysisWarning, GroupResult, MetricSet, MetricValue, RawBatch, RawMetricRow, RawValue,
    Snapshot,
};
