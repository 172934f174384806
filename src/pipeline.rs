use std::future::Future;
use std::sync::Arc;

use log::info;
use tokio::select;
use tokio::sync::broadcast;

use crate::bus::{
    Capability, Coordinator, CoordinatorOptions, PipelineError, PipelineEvent, SubscribeError,
    Subscriber, SubscriberId,
};
use crate::config::AtlasConfig;
use crate::metrics::{
    Collector, CollectorHandle, CollectorOptions, DataAnalyzer, MetricSchema, MetricSource,
};
use crate::store::{SnapshotStore, StoreError};

/// Store, coordinator, analyzer and collector wired from one configuration.
pub struct Pipeline {
    config: AtlasConfig,
    source: Arc<dyn MetricSource>,
    analyzer: DataAnalyzer,
    coordinator: Arc<Coordinator>,
    collector: Option<CollectorHandle>,
}

impl Pipeline {
    /// Open the configured database and wire the components around it.
    pub fn open(
        config: &AtlasConfig,
        source: Arc<dyn MetricSource>,
        schema: MetricSchema,
    ) -> Result<Self, StoreError> {
        let store = SnapshotStore::open(&config.database_path, config.store_options())?;
        Ok(Self::with_store(config, store, source, schema))
    }

    pub fn with_store(
        config: &AtlasConfig,
        store: SnapshotStore,
        source: Arc<dyn MetricSource>,
        schema: MetricSchema,
    ) -> Self {
        let coordinator = Arc::new(Coordinator::new(store, CoordinatorOptions::from(config)));
        Pipeline {
            config: config.clone(),
            source,
            analyzer: DataAnalyzer::new(Arc::new(schema)),
            coordinator,
            collector: None,
        }
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.coordinator.events().subscribe()
    }

    pub async fn subscribe(
        &self,
        subscriber: Arc<dyn Subscriber>,
        capability: Capability,
    ) -> Result<SubscriberId, SubscribeError> {
        self.coordinator.subscribe(subscriber, capability).await
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.coordinator.unsubscribe(id)
    }

    pub fn is_running(&self) -> bool {
        self.collector
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Spawn the collector on the current runtime. Starting twice is a no-op.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.collector.is_some() {
            return Ok(());
        }
        let collector = Collector::new(
            Arc::clone(&self.source),
            self.analyzer.clone(),
            Arc::clone(&self.coordinator),
            CollectorOptions::from(&self.config),
        )?;
        self.collector = Some(CollectorHandle::spawn(
            collector,
            self.config.collection_interval,
        ));
        info!(
            "pipeline started: {} every {:?}",
            self.config.source_query, self.config.collection_interval
        );
        Ok(())
    }

    /// Run until `signal` resolves or the store is found corrupted, then
    /// stop after the round in progress.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), PipelineError>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        let Some(handle) = self.collector.take() else {
            return Ok(());
        };
        let cancel = handle.cancellation_token();
        let finished = handle.wait();
        tokio::pin!(finished);
        tokio::pin!(signal);

        select! {
            result = &mut finished => return result,
            _ = &mut signal => {
                info!("shutdown requested");
                cancel.cancel();
            }
        }
        finished.await
    }

    /// Stop the collector, letting the round in progress persist.
    pub async fn shutdown(&mut self) -> Result<(), PipelineError> {
        match self.collector.take() {
            Some(handle) => {
                let result = handle.shutdown().await;
                info!("pipeline stopped");
                result
            }
            None => Ok(()),
        }
    }
}
