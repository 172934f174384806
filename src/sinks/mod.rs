//! Downstream consumers attached to the coordinator.

mod alerts;
mod dashboard;
#[cfg(feature = "mq")]
mod mq;
#[cfg(test)]
mod tests;

pub use alerts::{AlertSink, AlertSubscriber, LogAlertSink};
pub use dashboard::{DashboardFeed, DashboardSummary, StatementMetric, TrendPoint};
#[cfg(feature = "mq")]
pub use mq::{FlatRecord, LogPublisher, MessagePublisher, MqBridge, PublishError};
