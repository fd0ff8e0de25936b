//! PipelineBuilder: wiring and startup validation.
//!
//! Every port defaults to its in-memory implementation; callers override
//! the ones backed by real systems. With `expect_all_models()`, `build()`
//! fails when the routing table can pick a model that has no provider, so a
//! misconfigured deployment is caught before it takes traffic.

use std::sync::Arc;

use crate::admission::{AdmissionController, AdmissionPorts};
use crate::config::PipelineConfig;
use crate::domain::RoutingTable;
use crate::gateway::SseGateway;
use crate::impls::{
    InMemoryAuditLog, InMemoryCounterStore, InMemoryEventBus, InMemoryEventLog,
    InMemoryRefundLedger, InMemoryStageStore,
};
use crate::ports::{
    AnalyticsSink, AuditSink, Clock, CounterStore, EventBus, EventLog, IdGenerator,
    ModelProvider, RefundLedger, StageStore, SystemClock, UlidGenerator,
};
use crate::publisher::EventPublisher;
use crate::queue::{InMemoryTaskQueue, RetryPolicy, TaskQueue};
use crate::worker::{ProviderRegistry, RegistryError, Worker, WorkerPorts};

use super::Pipeline;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing providers for models: {0:?}. The routing table can select these models but nothing serves them.")]
    MissingModels(Vec<String>),
}

/// Builds a [`Pipeline`].
///
/// ```ignore
/// let pipeline = PipelineBuilder::new(config)
///     .register_provider("text-lite", my_client)?
///     .expect_all_models()
///     .build()?;
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    providers: ProviderRegistry,
    expect_all_models: bool,
    clock: Option<Arc<dyn Clock>>,
    counters: Option<Arc<dyn CounterStore>>,
    log: Option<Arc<dyn EventLog>>,
    bus: Option<Arc<dyn EventBus>>,
    ledger: Option<Arc<dyn RefundLedger>>,
    stages: Option<Arc<dyn StageStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    queue: Option<Arc<dyn TaskQueue>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            providers: ProviderRegistry::new(),
            expect_all_models: false,
            clock: None,
            counters: None,
            log: None,
            bus: None,
            ledger: None,
            stages: None,
            audit: None,
            analytics: None,
            queue: None,
        }
    }

    pub fn register_provider<P: ModelProvider + 'static>(
        mut self,
        model_id: impl Into<String>,
        provider: P,
    ) -> Result<Self, RegistryError> {
        self.providers.register(model_id, provider)?;
        Ok(self)
    }

    pub fn register_shared_provider(
        mut self,
        model_id: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<Self, RegistryError> {
        self.providers.register_shared(model_id, provider)?;
        Ok(self)
    }

    /// Fail `build()` unless every routable model has a provider.
    pub fn expect_all_models(mut self) -> Self {
        self.expect_all_models = true;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn RefundLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_stage_store(mut self, stages: Arc<dyn StageStore>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.audit = Some(audit);
        self.analytics = Some(analytics);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        let routing = Arc::new(RoutingTable::new(self.config.routing.clone()));
        if self.expect_all_models {
            let wanted = routing.model_ids();
            let missing: Vec<String> = self
                .providers
                .missing(&wanted)
                .into_iter()
                .map(str::to_string)
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingModels(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let counters = self
            .counters
            .unwrap_or_else(|| Arc::new(InMemoryCounterStore::new(Arc::clone(&clock))));
        let log = self
            .log
            .unwrap_or_else(|| Arc::new(InMemoryEventLog::new(Arc::clone(&clock))));
        let bus = self.bus.unwrap_or_else(|| Arc::new(InMemoryEventBus::new()));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryRefundLedger::new()));
        let stages = self
            .stages
            .unwrap_or_else(|| Arc::new(InMemoryStageStore::new()));
        let audit_log = InMemoryAuditLog::new();
        let audit = self.audit.unwrap_or_else(|| Arc::new(audit_log.clone()));
        let analytics = self.analytics.unwrap_or_else(|| Arc::new(audit_log));
        let queue = self.queue.unwrap_or_else(|| {
            Arc::new(
                InMemoryTaskQueue::new(RetryPolicy::from_config(&self.config.queue), Arc::clone(&ids))
                    .with_clock(Arc::clone(&clock))
                    .with_retention(self.config.queue.retain_finished),
            )
        });

        let publisher = EventPublisher::new(
            Arc::clone(&log),
            bus,
            Arc::clone(&clock),
            self.config.publisher.clone(),
            self.config.is_development(),
        );
        let admission = AdmissionController::new(
            AdmissionPorts {
                counters: Arc::clone(&counters),
                queue: Arc::clone(&queue),
                routing: Arc::clone(&routing),
                ledger: Arc::clone(&ledger),
                audit,
                analytics,
                ids,
                clock,
            },
            &self.config,
        );
        let worker = Worker::new(
            WorkerPorts {
                counters,
                publisher: publisher.clone(),
                stages: Arc::clone(&stages),
                ledger,
                providers: Arc::new(self.providers),
                routing,
            },
            &self.config,
        );
        let gateway = SseGateway::new(Arc::clone(&log), self.config.gateway.clone());

        Ok(Pipeline {
            config: self.config,
            admission,
            worker,
            publisher,
            gateway,
            queue,
            log,
            stages,
        })
    }
}
