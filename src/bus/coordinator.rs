use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::time::timeout;

use super::events::{EventBus, PipelineEvent};
use super::subscription::{
    Capability, SubscriberError, SubscriberId, SubscriberState, Subscriber, SubscriptionRecord,
};
use super::{PipelineError, SubscribeError};
use crate::config::AtlasConfig;
use crate::metrics::Snapshot;
use crate::store::{SnapshotStore, StoreError};

#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    /// Upper bound for a single bootstrap or incremental delivery.
    pub subscriber_timeout: Duration,
    /// Report a gap when two consecutive snapshots of a source are further apart.
    pub gap_threshold: Option<Duration>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            subscriber_timeout: Duration::from_secs(5),
            gap_threshold: None,
        }
    }
}

impl From<&AtlasConfig> for CoordinatorOptions {
    fn from(config: &AtlasConfig) -> Self {
        CoordinatorOptions {
            subscriber_timeout: config.subscriber_timeout,
            gap_threshold: Some(config.gap_threshold()),
        }
    }
}

/// What happened to a snapshot handed to [`Coordinator::on_new_snapshot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Persisted { notified: usize, skipped: usize },
    /// Already persisted by an earlier delivery; nobody was notified.
    Duplicate,
    /// Older than the latest persisted snapshot of its source; dropped.
    OutOfOrder,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CollectorHealth {
    pub degraded: bool,
    pub consecutive_failed_rounds: u32,
    pub degraded_since: Option<DateTime<Utc>>,
}

type Registration = (SubscriptionRecord, Arc<dyn Subscriber>);

/// Single point of fan-out: the only writer to the store and the only
/// caller of subscribers.
///
/// Appends and bootstrap reads are serialized by one async lock, so a
/// subscriber attaching mid-stream gets every snapshot exactly once across
/// its history payload and the incremental notifications that follow.
pub struct Coordinator {
    store: SnapshotStore,
    registrations: DashMap<SubscriberId, Registration>,
    fanout: tokio::sync::Mutex<()>,
    events: EventBus,
    health: Mutex<CollectorHealth>,
    options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(store: SnapshotStore, options: CoordinatorOptions) -> Self {
        Coordinator {
            store,
            registrations: DashMap::new(),
            fanout: tokio::sync::Mutex::new(()),
            events: EventBus::new(),
            health: Mutex::new(CollectorHealth::default()),
            options,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Persist a snapshot, then notify every live incremental subscriber.
    ///
    /// Duplicate and out-of-order snapshots are absorbed here. Only store
    /// failures are returned, and of those only corruption is fatal.
    pub async fn on_new_snapshot(&self, snapshot: Snapshot) -> Result<Delivery, PipelineError> {
        let _guard = self.fanout.lock().await;

        self.detect_gap(&snapshot)?;

        match self.store.append(&snapshot) {
            Ok(_) => {}
            Err(StoreError::Duplicate { .. }) => {
                debug!(
                    "snapshot {} @ {} already persisted, skipping fan-out",
                    snapshot.source_query(),
                    snapshot.timestamp()
                );
                self.events.publish(PipelineEvent::DuplicateSkipped {
                    source_query: snapshot.source_query().to_string(),
                    timestamp: snapshot.timestamp(),
                });
                return Ok(Delivery::Duplicate);
            }
            Err(err @ StoreError::OutOfOrder { .. }) => {
                warn!("dropping snapshot: {}", err);
                self.events.publish(PipelineEvent::OutOfOrderSkipped {
                    source_query: snapshot.source_query().to_string(),
                    timestamp: snapshot.timestamp(),
                });
                return Ok(Delivery::OutOfOrder);
            }
            Err(err) => return Err(self.store_failure(err)),
        }

        let (notified, skipped) = self.fan_out(&snapshot).await;
        self.events.publish(PipelineEvent::SnapshotPersisted {
            source_query: snapshot.source_query().to_string(),
            timestamp: snapshot.timestamp(),
            notified,
            skipped,
        });
        Ok(Delivery::Persisted { notified, skipped })
    }

    async fn fan_out(&self, snapshot: &Snapshot) -> (usize, usize) {
        let targets: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .registrations
            .iter()
            .filter(|entry| {
                let record = &entry.value().0;
                record.state == SubscriberState::Live && record.capability.wants_incremental()
            })
            .map(|entry| (*entry.key(), Arc::clone(&entry.value().1)))
            .collect();

        let limit = self.options.subscriber_timeout;
        let outcomes = join_all(targets.into_iter().map(|(id, subscriber)| async move {
            let outcome = timeout(limit, subscriber.append_incremental(snapshot)).await;
            (id, outcome)
        }))
        .await;

        let mut notified = 0;
        let mut skipped = 0;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => {
                    if let Some(mut entry) = self.registrations.get_mut(&id) {
                        entry.0.advance(snapshot.timestamp());
                    }
                    notified += 1;
                }
                Ok(Err(SubscriberError::Permanent(reason))) => {
                    warn!("subscriber {} reported permanent failure: {}", id, reason);
                    self.remove(id);
                    skipped += 1;
                }
                Ok(Err(err)) => {
                    warn!("delivery to subscriber {} failed: {}", id, err);
                    self.mark_degraded(id);
                    self.events.publish(PipelineEvent::SubscriberFailed {
                        subscriber_id: id,
                        error: err.to_string(),
                    });
                    skipped += 1;
                }
                Err(_) => {
                    warn!(
                        "subscriber {} timed out after {:?}, skipped for {}",
                        id,
                        limit,
                        snapshot.timestamp()
                    );
                    self.mark_degraded(id);
                    self.events.publish(PipelineEvent::SubscriberTimeout {
                        subscriber_id: id,
                        timestamp: snapshot.timestamp(),
                    });
                    skipped += 1;
                }
            }
        }
        (notified, skipped)
    }

    /// Register a subscriber.
    ///
    /// With a bootstrap capability the full history is delivered before the
    /// subscriber is registered, and no snapshot can be persisted in
    /// between. If the bootstrap delivery fails the subscriber is not
    /// registered at all. A bootstrap-only subscriber is complete once its
    /// history is delivered and is not retained.
    pub async fn subscribe(
        &self,
        subscriber: Arc<dyn Subscriber>,
        capability: Capability,
    ) -> Result<SubscriberId, SubscribeError> {
        let mut record = SubscriptionRecord::new(subscriber.name(), capability);
        let id = record.subscriber_id;

        let _guard = self.fanout.lock().await;

        if capability.wants_bootstrap() {
            record.state = SubscriberState::Bootstrapping;
            let history = self
                .store
                .history()
                .and_then(|cursor| cursor.collect_all())
                .map_err(|err| {
                    if err.is_corruption() {
                        self.events.publish(PipelineEvent::StoreCorruption {
                            error: err.to_string(),
                        });
                    }
                    SubscribeError::Store(err)
                })?;

            let delivered = match timeout(
                self.options.subscriber_timeout,
                subscriber.load_initial(&history),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SubscriberError::Timeout),
            };
            if let Err(source) = delivered {
                warn!(
                    "bootstrap of subscriber {} ({}) failed: {}",
                    record.name, id, source
                );
                return Err(SubscribeError::Bootstrap {
                    name: record.name,
                    source,
                });
            }

            record.last_delivered_timestamp = history.last().map(Snapshot::timestamp);
            record.delivered_count = history.len() as u64;
            info!(
                "subscriber {} ({}) bootstrapped with {} snapshots",
                record.name,
                id,
                history.len()
            );
        }

        if !capability.wants_incremental() {
            return Ok(id);
        }

        record.state = SubscriberState::Live;
        info!("subscriber {} ({}) live as {:?}", record.name, id, capability);
        self.registrations.insert(id, (record, subscriber));
        Ok(id)
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registrations.remove(&id).is_some();
        if removed {
            info!("subscriber {} unsubscribed", id);
        }
        removed
    }

    fn remove(&self, id: SubscriberId) {
        if self.registrations.remove(&id).is_some() {
            self.events.publish(PipelineEvent::SubscriberRemoved { subscriber_id: id });
        }
    }

    fn mark_degraded(&self, id: SubscriberId) {
        if let Some(mut entry) = self.registrations.get_mut(&id) {
            entry.0.mark_degraded();
        }
    }

    pub fn subscription(&self, id: SubscriberId) -> Option<SubscriptionRecord> {
        self.registrations.get(&id).map(|entry| entry.0.clone())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.registrations
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect()
    }

    pub fn on_collector_degraded(&self, consecutive_failed_rounds: u32) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if !health.degraded {
            health.degraded_since = Some(Utc::now());
        }
        health.degraded = true;
        health.consecutive_failed_rounds = consecutive_failed_rounds;
        warn!(
            "collector degraded after {} consecutive failed rounds",
            consecutive_failed_rounds
        );
        self.events.publish(PipelineEvent::CollectorDegraded {
            consecutive_failed_rounds,
        });
    }

    pub fn on_collector_recovered(&self) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if !health.degraded {
            return;
        }
        *health = CollectorHealth::default();
        info!("collector recovered");
        self.events.publish(PipelineEvent::CollectorRecovered);
    }

    pub fn health(&self) -> CollectorHealth {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn detect_gap(&self, snapshot: &Snapshot) -> Result<(), PipelineError> {
        let Some(threshold) = self.options.gap_threshold else {
            return Ok(());
        };
        let previous = match self.store.latest_timestamp_for(snapshot.source_query()) {
            Ok(Some(previous)) => previous,
            Ok(None) => return Ok(()),
            Err(err) if err.is_corruption() => return Err(self.store_failure(err)),
            Err(err) => {
                warn!("gap check skipped: {}", err);
                return Ok(());
            }
        };
        let gap = (snapshot.timestamp() - previous).to_std();
        if matches!(gap, Ok(gap) if gap > threshold) {
            warn!(
                "gap in {} history: {} -> {}",
                snapshot.source_query(),
                previous,
                snapshot.timestamp()
            );
            self.events.publish(PipelineEvent::GapDetected {
                source_query: snapshot.source_query().to_string(),
                previous,
                current: snapshot.timestamp(),
            });
        }
        Ok(())
    }

    fn store_failure(&self, err: StoreError) -> PipelineError {
        if err.is_corruption() {
            error!("{}", err);
            self.events.publish(PipelineEvent::StoreCorruption {
                error: err.to_string(),
            });
        } else {
            error!("snapshot store failure: {}", err);
        }
        PipelineError::from(err)
    }
}
