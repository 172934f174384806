//! Observer bus: fan-out from the analyzer to the store and to subscribers.

mod coordinator;
mod events;
mod subscription;
#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::store::StoreError;

pub use coordinator::{CollectorHealth, Coordinator, CoordinatorOptions, Delivery};
pub use events::{EventBus, PipelineEvent};
pub use subscription::{
    Capability, SubscriberError, SubscriberId, SubscriberState, Subscriber, SubscriptionRecord,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The only condition that halts the pipeline.
    #[error("snapshot store corrupted: {0}")]
    StoreCorruption(StoreError),
    #[error("snapshot store failure: {0}")]
    Store(StoreError),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::StoreCorruption(_))
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        if err.is_corruption() {
            PipelineError::StoreCorruption(err)
        } else {
            PipelineError::Store(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("could not read history: {0}")]
    Store(#[from] StoreError),
    #[error("bootstrap delivery to {name} failed: {source}")]
    Bootstrap {
        name: String,
        source: SubscriberError,
    },
}
