use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use log::debug;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use crate::bus::{Subscriber, SubscriberError};
use crate::metrics::{split_metric_name, Snapshot};

const DEFAULT_CAPACITY: usize = 10_000;

/// Headline figures over every cached snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub snapshot_count: usize,
    pub statement_count: usize,
    pub avg_response_time_ms: Option<f64>,
    pub avg_cpu_time_ms: Option<f64>,
    pub avg_logical_reads: Option<f64>,
    pub avg_physical_reads: Option<f64>,
    pub total_executions: f64,
    pub last_collection: Option<DateTime<Utc>>,
}

/// Latest value of one metric for one statement.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatementMetric {
    pub key: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Hourly aggregate of the cached history.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrendPoint {
    pub hour: DateTime<Utc>,
    pub avg_elapsed_time_ms: Option<f64>,
    pub avg_cpu_time_ms: Option<f64>,
    pub avg_logical_reads: Option<f64>,
    pub avg_physical_reads: Option<f64>,
    pub execution_count: f64,
}

#[derive(Default)]
struct FeedState {
    snapshots: VecDeque<Snapshot>,
    last_update: Option<DateTime<Utc>>,
}

/// In-memory view for a presentation layer.
///
/// Bootstrap replaces the cache with the persisted history; incremental
/// deliveries append to it. Oldest entries are evicted past `capacity`.
pub struct DashboardFeed {
    name: String,
    capacity: usize,
    state: RwLock<FeedState>,
    updated: Notify,
}

impl DashboardFeed {
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(name: &str, capacity: usize) -> Self {
        DashboardFeed {
            name: name.to_string(),
            capacity: capacity.max(1),
            state: RwLock::new(FeedState::default()),
            updated: Notify::new(),
        }
    }

    /// Resolves on the next load or append.
    pub async fn wait_for_update(&self) {
        self.updated.notified().await;
    }

    pub async fn snapshots(&self) -> Vec<Snapshot> {
        self.state.read().await.snapshots.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.snapshots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.snapshots.is_empty()
    }

    /// Wall-clock time of the last load or append.
    pub async fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_update
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.snapshots.clear();
        state.last_update = None;
        drop(state);
        self.updated.notify_waiters();
    }

    pub async fn summary(&self) -> DashboardSummary {
        let state = self.state.read().await;
        let mut statements: Vec<&str> = Vec::new();
        let mut elapsed = Mean::default();
        let mut cpu = Mean::default();
        let mut logical = Mean::default();
        let mut physical = Mean::default();
        let mut executions = 0.0;

        for snapshot in &state.snapshots {
            for (name, value) in snapshot.metric_set() {
                let (key, metric) = split_metric_name(name);
                if let Some(key) = key {
                    if !statements.contains(&key) {
                        statements.push(key);
                    }
                }
                let value = value.as_f64();
                match metric {
                    "avg_elapsed_time_ms" => elapsed.add(value),
                    "avg_cpu_time_ms" => cpu.add(value),
                    "avg_logical_reads" => logical.add(value),
                    "avg_physical_reads" => physical.add(value),
                    "execution_count" => executions += value,
                    _ => {}
                }
            }
        }

        DashboardSummary {
            snapshot_count: state.snapshots.len(),
            statement_count: statements.len(),
            avg_response_time_ms: elapsed.value(),
            avg_cpu_time_ms: cpu.value(),
            avg_logical_reads: logical.value(),
            avg_physical_reads: physical.value(),
            total_executions: executions,
            last_collection: state.snapshots.back().map(Snapshot::timestamp),
        }
    }

    /// Statements with the largest latest value of `metric`, descending.
    pub async fn top_by_metric(&self, metric: &str, limit: usize) -> Vec<StatementMetric> {
        let state = self.state.read().await;
        let mut latest: HashMap<&str, StatementMetric> = HashMap::new();

        for snapshot in &state.snapshots {
            for (name, value) in snapshot.metric_set() {
                if let (Some(key), name_metric) = split_metric_name(name) {
                    if name_metric == metric {
                        latest.insert(
                            key,
                            StatementMetric {
                                key: key.to_string(),
                                value: value.as_f64(),
                                timestamp: snapshot.timestamp(),
                            },
                        );
                    }
                }
            }
        }

        let mut ranked: Vec<StatementMetric> = latest.into_values().collect();
        ranked.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.key.cmp(&b.key)));
        ranked.truncate(limit);
        ranked
    }

    /// Hourly averages over snapshots newer than `now - window`.
    pub async fn trends(&self, window: Duration, now: DateTime<Utc>) -> Vec<TrendPoint> {
        let state = self.state.read().await;
        let cutoff = now - window;
        let mut buckets: BTreeMap<DateTime<Utc>, [Mean; 4]> = BTreeMap::new();
        let mut executions: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();

        for snapshot in state.snapshots.iter().filter(|s| s.timestamp() >= cutoff) {
            let Ok(hour) = snapshot.timestamp().duration_trunc(Duration::hours(1)) else {
                continue;
            };
            let means = buckets.entry(hour).or_default();
            let count = executions.entry(hour).or_insert(0.0);
            for (name, value) in snapshot.metric_set() {
                let value = value.as_f64();
                match split_metric_name(name).1 {
                    "avg_elapsed_time_ms" => means[0].add(value),
                    "avg_cpu_time_ms" => means[1].add(value),
                    "avg_logical_reads" => means[2].add(value),
                    "avg_physical_reads" => means[3].add(value),
                    "execution_count" => *count += value,
                    _ => {}
                }
            }
        }

        buckets
            .into_iter()
            .map(|(hour, means)| TrendPoint {
                hour,
                avg_elapsed_time_ms: means[0].value(),
                avg_cpu_time_ms: means[1].value(),
                avg_logical_reads: means[2].value(),
                avg_physical_reads: means[3].value(),
                execution_count: executions.get(&hour).copied().unwrap_or(0.0),
            })
            .collect()
    }

    fn evict(&self, state: &mut FeedState) {
        while state.snapshots.len() > self.capacity {
            state.snapshots.pop_front();
        }
    }
}

#[async_trait]
impl Subscriber for DashboardFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_initial(&self, history: &[Snapshot]) -> Result<(), SubscriberError> {
        let mut state = self.state.write().await;
        state.snapshots = history.iter().cloned().collect();
        self.evict(&mut state);
        state.last_update = Some(Utc::now());
        debug!("{} loaded {} snapshots", self.name, state.snapshots.len());
        drop(state);
        self.updated.notify_waiters();
        Ok(())
    }

    async fn append_incremental(&self, snapshot: &Snapshot) -> Result<(), SubscriberError> {
        let mut state = self.state.write().await;
        state.snapshots.push_back(snapshot.clone());
        self.evict(&mut state);
        state.last_update = Some(Utc::now());
        drop(state);
        self.updated.notify_waiters();
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}
