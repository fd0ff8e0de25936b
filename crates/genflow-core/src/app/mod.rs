//! App: wires the components into one pipeline.
//!
//! # Main pieces
//! - **PipelineBuilder**: wiring and startup validation
//! - **Pipeline**: shared handles to every component
//! - **DispatcherGroup**: loops that lease deliveries and hand them to the worker

pub mod builder;
pub mod dispatcher;

pub use self::builder::{BuildError, PipelineBuilder};
pub use self::dispatcher::{DeliveryTarget, DispatcherGroup, parse_worker_url};

use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::config::PipelineConfig;
use crate::gateway::SseGateway;
use crate::observability::QueueCounts;
use crate::ports::{EventLog, StageStore};
use crate::publisher::EventPublisher;
use crate::queue::{QueueError, TaskQueue};
use crate::worker::Worker;

/// A built pipeline. Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct Pipeline {
    pub config: PipelineConfig,
    pub admission: AdmissionController,
    pub worker: Worker,
    pub publisher: EventPublisher,
    pub gateway: SseGateway,
    pub queue: Arc<dyn TaskQueue>,
    pub log: Arc<dyn EventLog>,
    pub stages: Arc<dyn StageStore>,
}

impl Pipeline {
    /// Start `n` dispatchers delivering queued tasks to this pipeline's worker.
    pub fn spawn_dispatchers(&self, n: usize) -> DispatcherGroup {
        let target: Arc<dyn DeliveryTarget> = Arc::new(self.worker.clone());
        DispatcherGroup::spawn(n, Arc::clone(&self.queue), target)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, QueueError> {
        self.queue.counts().await
    }
}
