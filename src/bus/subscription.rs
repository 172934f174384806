use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::Snapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        SubscriberId(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which delivery channels a subscriber wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Bootstrap,
    Incremental,
    Both,
}

impl Capability {
    pub fn wants_bootstrap(&self) -> bool {
        matches!(self, Capability::Bootstrap | Capability::Both)
    }

    pub fn wants_incremental(&self) -> bool {
        matches!(self, Capability::Incremental | Capability::Both)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    Unregistered,
    Bootstrapping,
    Live,
}

/// Book-keeping for one attached consumer. Only the coordinator writes it.
#[derive(Clone, Debug, Serialize)]
pub struct SubscriptionRecord {
    pub subscriber_id: SubscriberId,
    pub name: String,
    pub capability: Capability,
    pub state: SubscriberState,
    /// Last snapshot timestamp successfully delivered.
    pub last_delivered_timestamp: Option<DateTime<Utc>>,
    /// Set when the most recent delivery failed or timed out.
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub delivered_count: u64,
}

impl SubscriptionRecord {
    pub(crate) fn new(name: &str, capability: Capability) -> Self {
        SubscriptionRecord {
            subscriber_id: SubscriberId::new(),
            name: name.to_string(),
            capability,
            state: SubscriberState::Unregistered,
            last_delivered_timestamp: None,
            degraded: false,
            consecutive_failures: 0,
            delivered_count: 0,
        }
    }

    pub(crate) fn advance(&mut self, timestamp: DateTime<Utc>) {
        self.last_delivered_timestamp = Some(match self.last_delivered_timestamp {
            Some(prev) if prev > timestamp => prev,
            _ => timestamp,
        });
        self.degraded = false;
        self.consecutive_failures = 0;
        self.delivered_count += 1;
    }

    pub(crate) fn mark_degraded(&mut self) {
        self.degraded = true;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

#[derive(Debug, Error)]
pub enum SubscriberError {
    /// The delivery failed but the subscriber may recover.
    #[error("delivery failed: {0}")]
    Failed(String),
    /// The subscriber will never accept deliveries again.
    #[error("subscriber gone: {0}")]
    Permanent(String),
    #[error("delivery timed out")]
    Timeout,
}

/// A downstream consumer of snapshots.
///
/// History arrives once through [`Subscriber::load_initial`]; afterwards
/// each newly persisted snapshot arrives through
/// [`Subscriber::append_incremental`]. No snapshot is sent on both channels
/// during one subscription.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn load_initial(&self, history: &[Snapshot]) -> Result<(), SubscriberError>;

    async fn append_incremental(&self, snapshot: &Snapshot) -> Result<(), SubscriberError>;
}
