#![cfg(test)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use super::*;
use crate::bus::{Subscriber, SubscriberError};
use crate::metrics::{MetricSet, MetricValue, Snapshot};
use crate::thresholds::{PerformanceThresholds, ThresholdBreach, ThresholdEvaluator};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn statement_snapshot(secs: i64, stats: &[(&str, u64, i64)]) -> Snapshot {
    let mut set = MetricSet::new();
    for (key, avg_ms, executions) in stats {
        set.insert(
            format!("{}.avg_elapsed_time_ms", key),
            MetricValue::Duration(Duration::from_millis(*avg_ms)),
        );
        set.insert(
            format!("{}.execution_count", key),
            MetricValue::Integer(*executions),
        );
    }
    Snapshot::new(at(secs), "query_stats", set)
}

#[tokio::test]
async fn dashboard_bootstrap_then_append() {
    let feed = DashboardFeed::new("dashboard");
    let history = vec![
        statement_snapshot(3_600, &[("0xA", 100, 2)]),
        statement_snapshot(3_660, &[("0xA", 300, 4), ("0xB", 50, 1)]),
    ];

    feed.load_initial(&history).await.unwrap();
    feed.append_incremental(&statement_snapshot(7_300, &[("0xB", 900, 3)]))
        .await
        .unwrap();

    assert_eq!(feed.len().await, 3);
    assert!(feed.last_update().await.is_some());

    let summary = feed.summary().await;
    assert_eq!(summary.snapshot_count, 3);
    assert_eq!(summary.statement_count, 2);
    assert_eq!(summary.avg_response_time_ms, Some(1350.0 / 4.0));
    assert_eq!(summary.total_executions, 10.0);
    assert_eq!(summary.last_collection, Some(at(7_300)));
    assert_eq!(summary.avg_cpu_time_ms, None);

    let top = feed.top_by_metric("avg_elapsed_time_ms", 5).await;
    let ranked: Vec<(&str, f64)> = top.iter().map(|m| (m.key.as_str(), m.value)).collect();
    assert_eq!(ranked, vec![("0xB", 900.0), ("0xA", 300.0)]);
    assert_eq!(top[0].timestamp, at(7_300));

    let trends = feed.trends(chrono::Duration::hours(24), at(8_000)).await;
    assert_eq!(trends.len(), 2);
    assert_eq!(trends[0].hour, at(3_600));
    assert_eq!(trends[0].avg_elapsed_time_ms, Some(150.0));
    assert_eq!(trends[0].execution_count, 7.0);
    assert_eq!(trends[1].hour, at(7_200));
    assert_eq!(trends[1].execution_count, 3.0);
}

#[tokio::test]
async fn dashboard_reload_replaces_cache_and_evicts_oldest() {
    let feed = DashboardFeed::with_capacity("dashboard", 2);
    feed.append_incremental(&statement_snapshot(10, &[("0xA", 1, 1)]))
        .await
        .unwrap();

    feed.load_initial(&[
        statement_snapshot(20, &[("0xA", 1, 1)]),
        statement_snapshot(30, &[("0xA", 1, 1)]),
        statement_snapshot(40, &[("0xA", 1, 1)]),
    ])
    .await
    .unwrap();

    let kept: Vec<DateTime<Utc>> = feed.snapshots().await.iter().map(Snapshot::timestamp).collect();
    assert_eq!(kept, vec![at(30), at(40)]);

    feed.clear().await;
    assert!(feed.is_empty().await);
    assert_eq!(feed.summary().await, DashboardSummary::default());
}

#[derive(Default)]
struct RecordingAlertSink {
    raised: Mutex<Vec<(DateTime<Utc>, Vec<ThresholdBreach>)>>,
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn raise(
        &self,
        _source_query: &str,
        timestamp: DateTime<Utc>,
        breaches: &[ThresholdBreach],
    ) -> Result<(), SubscriberError> {
        self.raised
            .lock()
            .unwrap()
            .push((timestamp, breaches.to_vec()));
        Ok(())
    }
}

#[tokio::test]
async fn alerts_only_raise_for_breaching_snapshots() {
    let sink = Arc::new(RecordingAlertSink::default());
    let alerts = AlertSubscriber::new(
        "alerts",
        ThresholdEvaluator::new(PerformanceThresholds::default()),
        sink.clone(),
    );

    alerts
        .load_initial(&[statement_snapshot(60, &[("0xA", 9_000, 1)])])
        .await
        .unwrap();
    alerts
        .append_incremental(&statement_snapshot(120, &[("0xA", 20, 1)]))
        .await
        .unwrap();
    alerts
        .append_incremental(&statement_snapshot(180, &[("0xA", 2_500, 1)]))
        .await
        .unwrap();

    let raised = sink.raised.lock().unwrap();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].0, at(180));
    assert_eq!(raised[0].1[0].key.as_deref(), Some("0xA"));
    assert_eq!(raised[0].1[0].severity, 2.5);
}

#[cfg(feature = "mq")]
mod bridge {
    use super::*;
    use crate::config::MqConfig;

    struct RecordingPublisher {
        sent: Mutex<Vec<(String, String, Vec<u8>)>>,
        reject: bool,
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            body: &[u8],
        ) -> Result<(), PublishError> {
            if self.reject {
                return Err(PublishError::Rejected("no such exchange".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((exchange.to_string(), routing_key.to_string(), body.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn bridge_publishes_flat_records() {
        let publisher = Arc::new(RecordingPublisher {
            sent: Mutex::new(Vec::new()),
            reject: false,
        });
        let bridge = MqBridge::new(MqConfig::default(), publisher.clone());
        let snapshot = statement_snapshot(60, &[("0xA", 250, 4)]);

        bridge.load_initial(&[snapshot.clone()]).await.unwrap();
        assert!(publisher.sent.lock().unwrap().is_empty());

        bridge.append_incremental(&snapshot).await.unwrap();
        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "atlas_performance");
        assert_eq!(sent[0].1, "atlas_performance_key");
        let record: FlatRecord = serde_json::from_slice(&sent[0].2).unwrap();
        assert_eq!(record, FlatRecord::from(&snapshot));
        assert_eq!(record.metrics["0xA.avg_elapsed_time_ms"], 250.0);
        assert_eq!(record.metrics["0xA.execution_count"], 4.0);
    }

    #[tokio::test]
    async fn rejected_publish_is_permanent() {
        let publisher = Arc::new(RecordingPublisher {
            sent: Mutex::new(Vec::new()),
            reject: true,
        });
        let bridge = MqBridge::new(MqConfig::default(), publisher);

        let err = bridge
            .append_incremental(&statement_snapshot(60, &[("0xA", 1, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriberError::Permanent(_)));
    }
}
