use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SubsecRound, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::analyzer::DataAnalyzer;
use super::source::{CollectionError, MetricSource};
use super::types::RawBatch;
use crate::bus::{Coordinator, Delivery, PipelineError, PipelineEvent};
use crate::config::AtlasConfig;
use crate::store::StoreError;

#[derive(Clone, Debug)]
pub struct CollectorOptions {
    pub source_query: String,
    /// Upper bound for one group query.
    pub query_timeout: Duration,
    /// Consecutive fully failed rounds before the collector reports itself degraded.
    pub degraded_after: u32,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        CollectorOptions {
            source_query: "query_stats".to_string(),
            query_timeout: Duration::from_secs(10),
            degraded_after: 3,
        }
    }
}

impl From<&AtlasConfig> for CollectorOptions {
    fn from(config: &AtlasConfig) -> Self {
        CollectorOptions {
            source_query: config.source_query.clone(),
            query_timeout: config.query_timeout,
            degraded_after: config.degraded_after,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A snapshot reached the coordinator.
    Delivered {
        timestamp: DateTime<Utc>,
        delivery: Delivery,
        failed_groups: usize,
    },
    /// Some groups answered but nothing survived analysis; nothing was forwarded.
    Empty {
        timestamp: DateTime<Utc>,
        failed_groups: usize,
    },
    /// Every group query failed.
    Failed { consecutive_failed_rounds: u32 },
}

/// Drives the database source on a fixed interval and forwards one snapshot
/// per successful round to the coordinator.
pub struct Collector {
    source: Arc<dyn MetricSource>,
    analyzer: DataAnalyzer,
    coordinator: Arc<Coordinator>,
    options: CollectorOptions,
    last_timestamp: Option<DateTime<Utc>>,
    consecutive_failed_rounds: u32,
    degraded: bool,
}

impl Collector {
    /// The timestamp clock resumes from the newest persisted snapshot of the
    /// source, so a restart never produces an older timestamp.
    pub fn new(
        source: Arc<dyn MetricSource>,
        analyzer: DataAnalyzer,
        coordinator: Arc<Coordinator>,
        options: CollectorOptions,
    ) -> Result<Self, StoreError> {
        let last_timestamp = coordinator
            .store()
            .latest_timestamp_for(&options.source_query)?;
        Ok(Collector {
            source,
            analyzer,
            coordinator,
            options,
            last_timestamp,
            consecutive_failed_rounds: 0,
            degraded: false,
        })
    }

    pub fn options(&self) -> &CollectorOptions {
        &self.options
    }

    /// Wall clock at microsecond precision, forced strictly past the last
    /// timestamp handed out.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }

    /// One collection round: query every group, analyze, hand the snapshot
    /// to the coordinator.
    ///
    /// Failed groups are logged and left out of the batch. Only a store
    /// failure raised by the coordinator is returned as an error.
    pub async fn run_round(&mut self) -> Result<RoundOutcome, PipelineError> {
        let mut timer = RoundTimer::start();
        let collected_at = self.next_timestamp();

        let (batch, failures) = self.fetch_groups(collected_at).await;
        timer.checkpoint("fetch");

        let group_count = self.analyzer.schema().groups.len();
        let failed_groups = failures.len();
        for err in &failures {
            warn!("collection error: {}", err);
            self.coordinator.events().publish(PipelineEvent::CollectionFailed {
                group: failed_group(err),
                error: err.to_string(),
            });
        }

        if group_count > 0 && failed_groups == group_count {
            self.consecutive_failed_rounds += 1;
            if self.consecutive_failed_rounds >= self.options.degraded_after && !self.degraded {
                self.degraded = true;
                self.coordinator
                    .on_collector_degraded(self.consecutive_failed_rounds);
            }
            return Ok(RoundOutcome::Failed {
                consecutive_failed_rounds: self.consecutive_failed_rounds,
            });
        }

        self.consecutive_failed_rounds = 0;
        if self.degraded {
            self.degraded = false;
            self.coordinator.on_collector_recovered();
        }

        let analysis = self.analyzer.analyze(&batch);
        timer.checkpoint("analyze");
        for warning in &analysis.warnings {
            self.coordinator.events().publish(PipelineEvent::AnalysisWarning {
                source_query: batch.source_query.clone(),
                warning: warning.to_string(),
            });
        }

        if analysis.snapshot.is_empty() {
            debug!(
                "round {} produced no metrics, nothing forwarded",
                collected_at
            );
            return Ok(RoundOutcome::Empty {
                timestamp: collected_at,
                failed_groups,
            });
        }

        let delivery = self.coordinator.on_new_snapshot(analysis.snapshot).await?;
        timer.checkpoint("deliver");
        timer.finish(collected_at);

        Ok(RoundOutcome::Delivered {
            timestamp: collected_at,
            delivery,
            failed_groups,
        })
    }

    async fn fetch_groups(&self, collected_at: DateTime<Utc>) -> (RawBatch, Vec<CollectionError>) {
        let limit = self.options.query_timeout;
        let groups = &self.analyzer.schema().groups;

        let results = join_all(groups.iter().map(|group| {
            let source = Arc::clone(&self.source);
            async move {
                let started = Instant::now();
                let result = match timeout(limit, source.fetch(group)).await {
                    Ok(result) => result,
                    Err(_) => Err(CollectionError::Timeout {
                        group: group.name.clone(),
                        elapsed: started.elapsed(),
                    }),
                };
                (group.name.as_str(), result)
            }
        }))
        .await;

        let mut batch = RawBatch::new(collected_at, &self.options.source_query);
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(rows) => batch = batch.with_group(name, rows),
                Err(err) => failures.push(err),
            }
        }
        (batch, failures)
    }

    /// Collect every `period` until cancelled.
    ///
    /// Rounds never overlap: a round that overruns the period swallows the
    /// missed ticks. Cancellation is observed between rounds, so a round in
    /// progress finishes persisting before the loop exits. Returns an error
    /// only when the store is corrupted.
    pub async fn run(mut self, period: Duration, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "collector started for {} every {:?}",
            self.options.source_query, period
        );

        loop {
            select! {
                _ = cancel.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_round().await {
                        Ok(outcome) => debug!("collection round: {:?}", outcome),
                        Err(err) if err.is_fatal() => {
                            error!("collector halted: {}", err);
                            return Err(err);
                        }
                        Err(err) => warn!("collection round lost: {}", err),
                    }
                }
            }
        }

        info!("collector stopped");
        Ok(())
    }
}

fn failed_group(err: &CollectionError) -> String {
    match err {
        CollectionError::Query { group, .. } | CollectionError::Timeout { group, .. } => {
            group.clone()
        }
        CollectionError::Unavailable(_) => "*".to_string(),
    }
}

struct RoundTimer {
    started: Instant,
    checkpoints: Vec<(&'static str, Duration)>,
}

impl RoundTimer {
    fn start() -> Self {
        RoundTimer {
            started: Instant::now(),
            checkpoints: Vec::new(),
        }
    }

    fn checkpoint(&mut self, name: &'static str) {
        self.checkpoints.push((name, self.started.elapsed()));
    }

    fn finish(self, collected_at: DateTime<Utc>) {
        debug!(
            "round {} took {:?} {:?}",
            collected_at,
            self.started.elapsed(),
            self.checkpoints
        );
    }
}

/// Owns a running collector task.
///
/// Dropping the handle cancels the task; [`CollectorHandle::shutdown`] also
/// waits for the round in progress to finish.
pub struct CollectorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl CollectorHandle {
    /// Must be called from within a tokio runtime.
    pub fn spawn(collector: Collector, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(period, cancel.clone()));
        CollectorHandle {
            cancel,
            task: Some(task),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Stop collecting and wait for the task to exit.
    pub async fn shutdown(mut self) -> Result<(), PipelineError> {
        self.cancel.cancel();
        self.join_task().await
    }

    /// Wait for the task to exit on its own, which only happens on a fatal
    /// store error or external cancellation.
    pub async fn wait(mut self) -> Result<(), PipelineError> {
        self.join_task().await
    }

    async fn join_task(&mut self) -> Result<(), PipelineError> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(err) => {
                    error!("collector task aborted: {}", err);
                    Ok(())
                }
            },
            None => Ok(()),
        }
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
