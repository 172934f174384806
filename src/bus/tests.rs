#![cfg(test)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;
use tokio::time::sleep;

use super::*;
use crate::metrics::{MetricSet, MetricValue, Snapshot};
use crate::store::{SnapshotStore, StoreOptions};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn snapshot(secs: i64) -> Snapshot {
    let mut metrics = MetricSet::new();
    metrics.insert("cpu".to_string(), MetricValue::Percentage(42.5));
    metrics.insert("io_wait".to_string(), MetricValue::Integer(3));
    Snapshot::new(at(secs), "query_stats", metrics)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Behaviour {
    Accept,
    Slow(Duration),
    Fail,
    Gone,
}

struct Recorder {
    name: String,
    behaviour: Mutex<Behaviour>,
    fail_bootstrap: bool,
    initial: Mutex<Vec<Vec<DateTime<Utc>>>>,
    incremental: Mutex<Vec<DateTime<Utc>>>,
}

impl Recorder {
    fn new(name: &str) -> Arc<Self> {
        Self::build(name, Behaviour::Accept, false)
    }

    fn build(name: &str, behaviour: Behaviour, fail_bootstrap: bool) -> Arc<Self> {
        Arc::new(Recorder {
            name: name.to_string(),
            behaviour: Mutex::new(behaviour),
            fail_bootstrap,
            initial: Mutex::new(Vec::new()),
            incremental: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    fn initial(&self) -> Vec<Vec<DateTime<Utc>>> {
        self.initial.lock().unwrap().clone()
    }

    fn incremental(&self) -> Vec<DateTime<Utc>> {
        self.incremental.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subscriber for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_initial(&self, history: &[Snapshot]) -> Result<(), SubscriberError> {
        if self.fail_bootstrap {
            return Err(SubscriberError::Failed("cannot render".to_string()));
        }
        self.initial
            .lock()
            .unwrap()
            .push(history.iter().map(Snapshot::timestamp).collect());
        Ok(())
    }

    async fn append_incremental(&self, snapshot: &Snapshot) -> Result<(), SubscriberError> {
        let behaviour = *self.behaviour.lock().unwrap();
        match behaviour {
            Behaviour::Accept => {}
            Behaviour::Slow(delay) => sleep(delay).await,
            Behaviour::Fail => return Err(SubscriberError::Failed("queue full".to_string())),
            Behaviour::Gone => return Err(SubscriberError::Permanent("closed".to_string())),
        }
        self.incremental.lock().unwrap().push(snapshot.timestamp());
        Ok(())
    }
}

fn coordinator_with(options: CoordinatorOptions) -> Arc<Coordinator> {
    let store = SnapshotStore::open_in_memory(StoreOptions::default()).unwrap();
    Arc::new(Coordinator::new(store, options))
}

fn coordinator() -> Arc<Coordinator> {
    coordinator_with(CoordinatorOptions {
        subscriber_timeout: Duration::from_millis(200),
        gap_threshold: None,
    })
}

fn drain(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn new_snapshot_is_persisted_and_delivered_once() {
    let coordinator = coordinator();
    let gui = Recorder::new("gui");
    let id = coordinator
        .subscribe(gui.clone(), Capability::Both)
        .await
        .unwrap();

    let delivery = coordinator.on_new_snapshot(snapshot(60)).await.unwrap();

    assert_eq!(
        delivery,
        Delivery::Persisted {
            notified: 1,
            skipped: 0
        }
    );
    assert_eq!(gui.initial(), vec![Vec::<DateTime<Utc>>::new()]);
    assert_eq!(gui.incremental(), vec![at(60)]);
    assert_eq!(coordinator.store().count().unwrap(), 1);

    let record = coordinator.subscription(id).unwrap();
    assert_eq!(record.state, SubscriberState::Live);
    assert_eq!(record.last_delivered_timestamp, Some(at(60)));
    assert_eq!(record.delivered_count, 1);
    assert!(!record.degraded);
}

#[tokio::test]
async fn late_subscriber_gets_history_then_only_new_snapshots() {
    let coordinator = coordinator();
    coordinator.on_new_snapshot(snapshot(10)).await.unwrap();
    coordinator.on_new_snapshot(snapshot(20)).await.unwrap();

    let gui = Recorder::new("gui");
    let id = coordinator
        .subscribe(gui.clone(), Capability::Both)
        .await
        .unwrap();
    assert_eq!(
        coordinator.subscription(id).unwrap().last_delivered_timestamp,
        Some(at(20))
    );

    coordinator.on_new_snapshot(snapshot(30)).await.unwrap();

    assert_eq!(gui.initial(), vec![vec![at(10), at(20)]]);
    assert_eq!(gui.incremental(), vec![at(30)]);
}

#[tokio::test]
async fn duplicate_snapshot_is_not_redelivered() {
    let coordinator = coordinator();
    let mut events = coordinator.events().subscribe();
    let gui = Recorder::new("gui");
    coordinator
        .subscribe(gui.clone(), Capability::Incremental)
        .await
        .unwrap();

    coordinator.on_new_snapshot(snapshot(60)).await.unwrap();
    let again = coordinator.on_new_snapshot(snapshot(60)).await.unwrap();

    assert_eq!(again, Delivery::Duplicate);
    assert_eq!(gui.incremental(), vec![at(60)]);
    assert_eq!(coordinator.store().count().unwrap(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, PipelineEvent::DuplicateSkipped { .. })));
}

#[tokio::test]
async fn out_of_order_snapshot_is_dropped() {
    let coordinator = coordinator();
    let gui = Recorder::new("gui");
    coordinator
        .subscribe(gui.clone(), Capability::Incremental)
        .await
        .unwrap();

    coordinator.on_new_snapshot(snapshot(120)).await.unwrap();
    let late = coordinator.on_new_snapshot(snapshot(60)).await.unwrap();

    assert_eq!(late, Delivery::OutOfOrder);
    assert_eq!(gui.incremental(), vec![at(120)]);
}

#[tokio::test]
async fn slow_subscriber_is_skipped_without_blocking_others() {
    let coordinator = coordinator();
    let mut events = coordinator.events().subscribe();
    let slow = Recorder::build("slow", Behaviour::Accept, false);
    let fast = Recorder::new("fast");
    let slow_id = coordinator
        .subscribe(slow.clone(), Capability::Incremental)
        .await
        .unwrap();
    coordinator
        .subscribe(fast.clone(), Capability::Incremental)
        .await
        .unwrap();

    coordinator.on_new_snapshot(snapshot(10)).await.unwrap();
    slow.set(Behaviour::Slow(Duration::from_secs(5)));
    let delivery = coordinator.on_new_snapshot(snapshot(20)).await.unwrap();

    assert_eq!(
        delivery,
        Delivery::Persisted {
            notified: 1,
            skipped: 1
        }
    );
    assert_eq!(fast.incremental(), vec![at(10), at(20)]);
    assert_eq!(slow.incremental(), vec![at(10)]);

    let record = coordinator.subscription(slow_id).unwrap();
    assert!(record.degraded);
    assert_eq!(record.last_delivered_timestamp, Some(at(10)));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        PipelineEvent::SubscriberTimeout { subscriber_id, timestamp }
            if *subscriber_id == slow_id && *timestamp == at(20)
    )));

    slow.set(Behaviour::Accept);
    coordinator.on_new_snapshot(snapshot(30)).await.unwrap();
    let record = coordinator.subscription(slow_id).unwrap();
    assert!(!record.degraded);
    assert_eq!(record.last_delivered_timestamp, Some(at(30)));
}

#[tokio::test]
async fn failing_subscriber_is_degraded_but_kept() {
    let coordinator = coordinator();
    let flaky = Recorder::build("flaky", Behaviour::Fail, false);
    let id = coordinator
        .subscribe(flaky.clone(), Capability::Incremental)
        .await
        .unwrap();

    coordinator.on_new_snapshot(snapshot(10)).await.unwrap();
    coordinator.on_new_snapshot(snapshot(20)).await.unwrap();

    let record = coordinator.subscription(id).unwrap();
    assert!(record.degraded);
    assert_eq!(record.consecutive_failures, 2);
    assert_eq!(record.last_delivered_timestamp, None);
}

#[tokio::test]
async fn permanently_failed_subscriber_is_removed() {
    let coordinator = coordinator();
    let mut events = coordinator.events().subscribe();
    let gone = Recorder::build("gone", Behaviour::Gone, false);
    let id = coordinator
        .subscribe(gone.clone(), Capability::Incremental)
        .await
        .unwrap();

    coordinator.on_new_snapshot(snapshot(10)).await.unwrap();

    assert!(coordinator.subscription(id).is_none());
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        PipelineEvent::SubscriberRemoved { subscriber_id } if *subscriber_id == id
    )));
    gone.set(Behaviour::Accept);
    coordinator.on_new_snapshot(snapshot(20)).await.unwrap();
    assert!(gone.incremental().is_empty());
}

#[tokio::test]
async fn failed_bootstrap_leaves_subscriber_unregistered() {
    let coordinator = coordinator();
    coordinator.on_new_snapshot(snapshot(10)).await.unwrap();
    let broken = Recorder::build("broken", Behaviour::Accept, true);

    let err = coordinator
        .subscribe(broken.clone(), Capability::Both)
        .await
        .unwrap_err();

    assert!(matches!(err, SubscribeError::Bootstrap { ref name, .. } if name == "broken"));
    assert!(coordinator.subscriptions().is_empty());
    coordinator.on_new_snapshot(snapshot(20)).await.unwrap();
    assert!(broken.incremental().is_empty());
}

#[tokio::test]
async fn bootstrap_only_subscriber_is_not_retained() {
    let coordinator = coordinator();
    coordinator.on_new_snapshot(snapshot(10)).await.unwrap();
    let report = Recorder::new("report");

    coordinator
        .subscribe(report.clone(), Capability::Bootstrap)
        .await
        .unwrap();
    coordinator.on_new_snapshot(snapshot(20)).await.unwrap();

    assert_eq!(report.initial(), vec![vec![at(10)]]);
    assert!(report.incremental().is_empty());
    assert!(coordinator.subscriptions().is_empty());
}

#[tokio::test]
async fn incremental_only_subscriber_skips_history() {
    let coordinator = coordinator();
    coordinator.on_new_snapshot(snapshot(10)).await.unwrap();
    let alerts = Recorder::new("alerts");

    let id = coordinator
        .subscribe(alerts.clone(), Capability::Incremental)
        .await
        .unwrap();
    assert_eq!(coordinator.subscription(id).unwrap().last_delivered_timestamp, None);
    coordinator.on_new_snapshot(snapshot(20)).await.unwrap();

    assert!(alerts.initial().is_empty());
    assert_eq!(alerts.incremental(), vec![at(20)]);
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let coordinator = coordinator();
    let gui = Recorder::new("gui");
    let id = coordinator
        .subscribe(gui.clone(), Capability::Incremental)
        .await
        .unwrap();

    assert!(coordinator.unsubscribe(id));
    assert!(!coordinator.unsubscribe(id));
    assert!(!coordinator.unsubscribe(SubscriberId::new()));

    coordinator.on_new_snapshot(snapshot(10)).await.unwrap();
    assert!(gui.incremental().is_empty());
}

#[tokio::test]
async fn collector_health_round_trip() {
    let coordinator = coordinator();
    let mut events = coordinator.events().subscribe();

    coordinator.on_collector_recovered();
    assert!(drain(&mut events).is_empty());

    coordinator.on_collector_degraded(3);
    let health = coordinator.health();
    assert!(health.degraded);
    assert_eq!(health.consecutive_failed_rounds, 3);
    let since = health.degraded_since;
    assert!(since.is_some());

    coordinator.on_collector_degraded(4);
    assert_eq!(coordinator.health().degraded_since, since);

    coordinator.on_collector_recovered();
    assert_eq!(coordinator.health(), CollectorHealth::default());
    assert_eq!(
        drain(&mut events),
        vec![
            PipelineEvent::CollectorDegraded {
                consecutive_failed_rounds: 3
            },
            PipelineEvent::CollectorDegraded {
                consecutive_failed_rounds: 4
            },
            PipelineEvent::CollectorRecovered,
        ]
    );
}

#[tokio::test]
async fn gap_in_history_is_reported() {
    let coordinator = coordinator_with(CoordinatorOptions {
        subscriber_timeout: Duration::from_millis(200),
        gap_threshold: Some(Duration::from_secs(180)),
    });
    let mut events = coordinator.events().subscribe();

    coordinator.on_new_snapshot(snapshot(0)).await.unwrap();
    coordinator.on_new_snapshot(snapshot(60)).await.unwrap();
    coordinator.on_new_snapshot(snapshot(600)).await.unwrap();

    let gaps: Vec<PipelineEvent> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::GapDetected { .. }))
        .collect();
    assert_eq!(
        gaps,
        vec![PipelineEvent::GapDetected {
            source_query: "query_stats".to_string(),
            previous: at(60),
            current: at(600),
        }]
    );
    assert_eq!(coordinator.store().count().unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribing_mid_stream_sees_every_snapshot_once() {
    let coordinator = coordinator();
    let writer = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            for secs in 1..=200 {
                coordinator.on_new_snapshot(snapshot(secs)).await.unwrap();
                if secs % 20 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    sleep(Duration::from_millis(1)).await;
    let gui = Recorder::new("gui");
    coordinator
        .subscribe(gui.clone(), Capability::Both)
        .await
        .unwrap();
    writer.await.unwrap();

    let history = gui.initial().concat();
    let incremental = gui.incremental();
    let mut seen: Vec<DateTime<Utc>> = history.iter().chain(incremental.iter()).copied().collect();
    let unique: HashSet<DateTime<Utc>> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "a snapshot was delivered twice");
    seen.sort();
    assert_eq!(seen, (1..=200).map(at).collect::<Vec<_>>());
    if let (Some(last_history), Some(first_new)) = (history.last(), incremental.first()) {
        assert!(last_history < first_new);
    }
}

#[tokio::test]
async fn snapshots_one_microsecond_apart_are_both_delivered() {
    let coordinator = coordinator();
    let gui = Recorder::new("gui");
    coordinator
        .subscribe(gui.clone(), Capability::Incremental)
        .await
        .unwrap();
    let base = at(100);
    let stamped = |nanos: i64| {
        Snapshot::new(
            base + chrono::Duration::nanoseconds(nanos),
            "query_stats",
            MetricSet::new(),
        )
    };

    let first = coordinator.on_new_snapshot(stamped(1_000)).await.unwrap();
    let second = coordinator.on_new_snapshot(stamped(2_500)).await.unwrap();
    let same_micro = coordinator.on_new_snapshot(stamped(2_900)).await.unwrap();

    assert!(matches!(first, Delivery::Persisted { notified: 1, .. }));
    assert!(matches!(second, Delivery::Persisted { notified: 1, .. }));
    assert_eq!(same_micro, Delivery::Duplicate);
    assert_eq!(
        gui.incremental(),
        vec![
            base + chrono::Duration::microseconds(1),
            base + chrono::Duration::microseconds(2)
        ]
    );
}
