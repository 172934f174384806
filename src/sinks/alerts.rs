use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::bus::{Subscriber, SubscriberError};
use crate::metrics::Snapshot;
use crate::thresholds::{ThresholdBreach, ThresholdEvaluator};

/// Where threshold breaches end up.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(
        &self,
        source_query: &str,
        timestamp: DateTime<Utc>,
        breaches: &[ThresholdBreach],
    ) -> Result<(), SubscriberError>;
}

/// Writes each breach to the log at `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(
        &self,
        source_query: &str,
        timestamp: DateTime<Utc>,
        breaches: &[ThresholdBreach],
    ) -> Result<(), SubscriberError> {
        for breach in breaches {
            warn!(
                "{} @ {}: {}{} = {:.2} ({:?} {:.2}, x{:.2}{})",
                source_query,
                timestamp,
                breach.key.as_deref().map(|k| format!("{}.", k)).unwrap_or_default(),
                breach.metric,
                breach.value,
                breach.comparison,
                breach.limit,
                breach.severity,
                if breach.frequent { ", frequent" } else { "" }
            );
        }
        Ok(())
    }
}

/// Evaluates each new snapshot against the thresholds and forwards any
/// breaches. History is not re-alerted, so this subscriber is meant to be
/// registered incremental-only.
pub struct AlertSubscriber {
    name: String,
    evaluator: ThresholdEvaluator,
    sink: Arc<dyn AlertSink>,
}

impl AlertSubscriber {
    pub fn new(name: &str, evaluator: ThresholdEvaluator, sink: Arc<dyn AlertSink>) -> Self {
        AlertSubscriber {
            name: name.to_string(),
            evaluator,
            sink,
        }
    }
}

#[async_trait]
impl Subscriber for AlertSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_initial(&self, history: &[Snapshot]) -> Result<(), SubscriberError> {
        debug!(
            "{} ignores {} historical snapshots",
            self.name,
            history.len()
        );
        Ok(())
    }

    async fn append_incremental(&self, snapshot: &Snapshot) -> Result<(), SubscriberError> {
        let breaches = self.evaluator.evaluate(snapshot);
        if breaches.is_empty() {
            return Ok(());
        }
        self.sink
            .raise(snapshot.source_query(), snapshot.timestamp(), &breaches)
            .await
    }
}
