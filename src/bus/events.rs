//! Observable pipeline events.
//!
//! Conditions absorbed by the layer that detects them (failed queries,
//! coercion warnings, slow subscribers) are published here so they stay
//! visible without interrupting collection.

use chrono::{DateTime, Utc};
use log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

use super::subscription::SubscriberId;

/// Maximum number of events buffered per receiver.
const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    SnapshotPersisted {
        source_query: String,
        timestamp: DateTime<Utc>,
        notified: usize,
        skipped: usize,
    },
    DuplicateSkipped {
        source_query: String,
        timestamp: DateTime<Utc>,
    },
    OutOfOrderSkipped {
        source_query: String,
        timestamp: DateTime<Utc>,
    },
    CollectionFailed {
        group: String,
        error: String,
    },
    AnalysisWarning {
        source_query: String,
        warning: String,
    },
    CollectorDegraded {
        consecutive_failed_rounds: u32,
    },
    CollectorRecovered,
    SubscriberTimeout {
        subscriber_id: SubscriberId,
        timestamp: DateTime<Utc>,
    },
    SubscriberFailed {
        subscriber_id: SubscriberId,
        error: String,
    },
    SubscriberRemoved {
        subscriber_id: SubscriberId,
    },
    GapDetected {
        source_query: String,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
    StoreCorruption {
        error: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget; an event with no receivers is dropped.
    pub fn publish(&self, event: PipelineEvent) {
        trace!("pipeline event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
