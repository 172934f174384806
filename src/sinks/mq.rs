use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Subscriber, SubscriberError};
use crate::config::MqConfig;
use crate::metrics::Snapshot;

#[derive(Debug, Error)]
pub enum PublishError {
    /// Worth retrying on the next snapshot.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// The broker refused the exchange or queue; retrying will not help.
    #[error("broker rejected message: {0}")]
    Rejected(String),
}

/// Transport to an external message broker. Connection handling belongs to
/// the implementation.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError>;
}

/// Snapshot flattened to plain numbers for external consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord {
    pub source_query: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
}

impl From<&Snapshot> for FlatRecord {
    fn from(snapshot: &Snapshot) -> Self {
        FlatRecord {
            source_query: snapshot.source_query().to_string(),
            timestamp: snapshot.timestamp(),
            metrics: snapshot
                .metric_set()
                .iter()
                .map(|(name, value)| (name.clone(), value.as_f64()))
                .collect(),
        }
    }
}

/// Logs each message instead of sending it; used when no broker is wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl MessagePublisher for LogPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        info!(
            "mq {}/{}: {}",
            exchange,
            routing_key,
            String::from_utf8_lossy(body)
        );
        Ok(())
    }
}

/// Forwards every new snapshot to the broker as a JSON [`FlatRecord`].
///
/// Delivery is at-least-once; consumers deduplicate on
/// `(source_query, timestamp)`. History is never replayed to the broker.
pub struct MqBridge {
    name: String,
    config: MqConfig,
    publisher: Arc<dyn MessagePublisher>,
}

impl MqBridge {
    pub fn new(config: MqConfig, publisher: Arc<dyn MessagePublisher>) -> Self {
        MqBridge {
            name: format!("mq:{}", config.exchange),
            config,
            publisher,
        }
    }
}

#[async_trait]
impl Subscriber for MqBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_initial(&self, history: &[Snapshot]) -> Result<(), SubscriberError> {
        debug!("{} skips {} historical snapshots", self.name, history.len());
        Ok(())
    }

    async fn append_incremental(&self, snapshot: &Snapshot) -> Result<(), SubscriberError> {
        let body = serde_json::to_vec(&FlatRecord::from(snapshot))
            .map_err(|e| SubscriberError::Failed(e.to_string()))?;
        self.publisher
            .publish(&self.config.exchange, &self.config.routing_key, &body)
            .await
            .map_err(|err| match err {
                PublishError::Unavailable(_) => SubscriberError::Failed(err.to_string()),
                PublishError::Rejected(_) => SubscriberError::Permanent(err.to_string()),
            })
    }
}
