pub mod bus;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod sinks;
pub mod store;
pub mod thresholds;

pub use bus::{Capability, Coordinator, PipelineError, PipelineEvent, Subscriber};
pub use config::AtlasConfig;
pub use metrics::{DataAnalyzer, MetricSchema, Snapshot};
pub use pipeline::Pipeline;
pub use store::{SnapshotStore, StoreError};
