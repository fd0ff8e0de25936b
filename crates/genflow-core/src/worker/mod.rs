//! Worker: executes one delivered task invocation.
//!
//! Every delivery goes through the same steps:
//!
//! 1. parse and route the invocation (bad input is a 400)
//! 2. skip deliveries whose stage already completed
//! 3. take the user and model guards, check the queue permit taken at
//!    admission (any refusal is a 429)
//! 4. execute against the routed provider within the execution timeout and
//!    publish events
//! 5. persist the outcome and hand off to the next stage
//! 6. give back every guard that was taken, whatever happened in 4 and 5,
//!    and the queue permit once the task is settled
//!
//! Execution failures are reported on the task's channel and answered with
//! 200. A failure that could not be reported is a 500, so the queue delivers
//! the task again.

mod execute;
mod guards;
mod registry;
mod schema;

pub use guards::{GuardError, GuardRequest, GuardSet, Hold};
pub use registry::{ProviderRegistry, RegistryError};
pub use schema::{SchemaError, parse_structured, required_fields};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use futures::FutureExt;
use serde_json::{Value, json};
use tracing::{Instrument, error, info, warn};

use crate::config::{BackpressureConfig, GuardConfig, PipelineConfig};
use crate::domain::{
    ChannelKey, ErrorStage, Event, EventBody, ExecutionKind, GuardKey, Phase, PipelineStatus,
    RoutingDecision, RoutingTable, Stage, StageStatus, TaskId, TaskInvocation, WorkerErrorCode,
    routing::parse_queue_id,
};
use crate::error::{PipelineError, StoreError};
use crate::observability::worker_span;
use crate::ports::{CompletionRequest, CounterStore, RefundLedger, StageStore};
use crate::publisher::EventPublisher;
use execute::Produced;

/// HTTP-shaped answer to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub status: StatusCode,
    pub body: Value,
    pub retry_after: Option<Duration>,
}

impl WorkerResponse {
    fn new(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK, json!({"ok": true}))
    }

    pub fn duplicate() -> Self {
        Self::new(StatusCode::OK, json!({"ok": true, "duplicate": true}))
    }

    /// Handled, but the stage failed and the failure was published.
    pub fn failed(code: WorkerErrorCode) -> Self {
        Self::new(StatusCode::OK, json!({"ok": true, "failed": code}))
    }

    pub fn throttled(code: WorkerErrorCode, retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, json!({"ok": false, "code": code}))
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            json!({"ok": false, "error": message.into()}),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"ok": false, "code": WorkerErrorCode::InternalError, "error": message.into()}),
        )
    }
}

/// Collaborators the worker talks to.
#[derive(Clone)]
pub struct WorkerPorts {
    pub counters: Arc<dyn CounterStore>,
    pub publisher: EventPublisher,
    pub stages: Arc<dyn StageStore>,
    pub ledger: Arc<dyn RefundLedger>,
    pub providers: Arc<ProviderRegistry>,
    pub routing: Arc<RoutingTable>,
}

#[derive(Clone)]
pub struct Worker {
    ports: WorkerPorts,
    guards: GuardConfig,
    backpressure: BackpressureConfig,
    idle_threshold: Duration,
    timeout: Duration,
}

/// A routed invocation.
pub(crate) struct Job {
    invocation: TaskInvocation,
    stage: Stage,
    kind: ExecutionKind,
    routing: RoutingDecision,
    channel: ChannelKey,
}

impl Job {
    fn task_id(&self) -> &TaskId {
        &self.invocation.task_id
    }

    fn completion_request(&self) -> CompletionRequest {
        CompletionRequest {
            model_id: self.routing.model_id.clone(),
            stage: self.stage,
            template_id: self.invocation.template_id.clone(),
            locale: self.invocation.locale.clone(),
            variables: self.invocation.variables.clone(),
        }
    }
}

enum RunOutcome {
    Completed,
    Failed(WorkerErrorCode),
    /// The failure could not be published.
    Unreported(StoreError),
}

impl Worker {
    pub fn new(ports: WorkerPorts, config: &PipelineConfig) -> Self {
        Self {
            ports,
            guards: config.guards.clone(),
            backpressure: config.backpressure.clone(),
            idle_threshold: config.worker.idle_threshold(),
            timeout: config.worker.timeout(),
        }
    }

    /// Entry point for `POST /worker/{kind}/{service}`.
    pub async fn handle(&self, kind: ExecutionKind, service_id: &str, body: &[u8]) -> WorkerResponse {
        match serde_json::from_slice::<TaskInvocation>(body) {
            Ok(invocation) => self.handle_invocation(kind, service_id, invocation).await,
            Err(err) => {
                warn!(error = %err, "malformed task body");
                WorkerResponse::bad_request(format!("malformed task body: {err}"))
            }
        }
    }

    pub async fn handle_invocation(
        &self,
        kind: ExecutionKind,
        service_id: &str,
        invocation: TaskInvocation,
    ) -> WorkerResponse {
        let span = worker_span(invocation.task_id.as_str(), kind.as_str(), service_id);
        self.process(kind, service_id, invocation).instrument(span).await
    }

    async fn process(
        &self,
        kind: ExecutionKind,
        service_id: &str,
        invocation: TaskInvocation,
    ) -> WorkerResponse {
        if invocation.service_id != service_id {
            return WorkerResponse::bad_request(format!(
                "task belongs to service {}, not {service_id}",
                invocation.service_id
            ));
        }
        let job = match self.route(kind, invocation) {
            Ok(job) => job,
            Err(err) => return WorkerResponse::bad_request(err.to_string()),
        };

        match self.ports.stages.get(job.task_id()).await {
            Ok(Some(record)) if record.status == StageStatus::Completed => {
                info!("stage already completed, skipping duplicate delivery");
                return WorkerResponse::duplicate();
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "stage lookup failed");
                return WorkerResponse::internal(err.to_string());
            }
        }

        let mut guards = match GuardSet::acquire(
            Arc::clone(&self.ports.counters),
            &self.guard_requests(&job),
            self.guards.ttl(),
            self.guards.retry_after(),
        )
        .await
        {
            Ok(guards) => guards,
            Err(err) => {
                let code = err.code();
                return match err {
                    GuardError::AtCapacity { key, retry_after } => {
                        info!(guard = %key, code = code.as_str(), "delivery throttled");
                        WorkerResponse::throttled(code, retry_after)
                    }
                    GuardError::Store(err) => {
                        error!(error = %err, "guard acquisition failed");
                        WorkerResponse::internal(err.to_string())
                    }
                };
            }
        };

        let execution = AssertUnwindSafe(self.run(&job)).catch_unwind();
        let outcome = match tokio::time::timeout(self.timeout, execution).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => {
                error!(error = %err, "execution aborted");
                self.failed(&job, WorkerErrorCode::InternalError, &err.to_string())
                    .await
            }
            Ok(Err(_)) => {
                error!("execution panicked");
                self.failed(&job, WorkerErrorCode::InternalError, "worker panicked")
                    .await
            }
            Err(_) => {
                let message = format!("execution timed out after {}s", self.timeout.as_secs());
                error!(timeout_secs = self.timeout.as_secs(), "execution timed out");
                self.failed(&job, WorkerErrorCode::LlmError, &message).await
            }
        };

        match outcome {
            RunOutcome::Completed => {
                guards.release().await;
                WorkerResponse::ok()
            }
            RunOutcome::Failed(code) => {
                guards.release().await;
                WorkerResponse::failed(code)
            }
            RunOutcome::Unreported(err) => {
                error!(error = %err, "failure could not be published");
                guards.release_taken().await;
                WorkerResponse::internal(err.to_string())
            }
        }
    }

    fn route(&self, kind: ExecutionKind, invocation: TaskInvocation) -> Result<Job, PipelineError> {
        let stage = self.ports.routing.stage(&invocation.template_id)?;
        let routing = self.ports.routing.decide(
            &invocation.template_id,
            &invocation.variables,
            invocation.has_quota,
        )?;
        let channel = ChannelKey::for_task(
            &invocation.service_id,
            &invocation.user_id,
            &invocation.task_id,
        );
        Ok(Job {
            invocation,
            stage,
            kind,
            routing,
            channel,
        })
    }

    fn guard_requests(&self, job: &Job) -> Vec<GuardRequest> {
        let tier = job.invocation.tier();
        let (_, modality) = parse_queue_id(&job.routing.queue_id)
            .unwrap_or((tier, job.stage.default_modality()));
        vec![
            GuardRequest::take(
                GuardKey::user(job.invocation.user_id.clone(), job.kind),
                self.guards.user_max,
            ),
            GuardRequest::take(
                GuardKey::model(job.routing.model_id.clone(), tier, job.kind),
                self.guards.model_max(tier),
            ),
            GuardRequest::admitted(
                GuardKey::queue(job.routing.queue_id.clone(), job.kind),
                self.backpressure.max_pending(tier, modality),
            ),
        ]
    }

    async fn run(&self, job: &Job) -> Result<RunOutcome, PipelineError> {
        let Some(provider) = self.ports.providers.get(&job.routing.model_id) else {
            let code = WorkerErrorCode::ProviderNotConfigured;
            let message = format!("no provider configured for model {}", job.routing.model_id);
            warn!(model_id = %job.routing.model_id, "provider not configured");
            return Ok(self.failed(job, code, &message).await);
        };

        self.ports
            .stages
            .persist(job.task_id(), None, StageStatus::Streaming)
            .await?;
        self.emit(job, EventBody::Start).await?;

        let produced = match job.kind {
            ExecutionKind::Stream => self.execute_stream(job, provider.as_ref()).await,
            ExecutionKind::Batch => self.execute_structured(job, provider.as_ref()).await,
        };

        match produced {
            Ok(produced) => {
                self.complete(job, produced).await?;
                info!(model_id = %job.routing.model_id, "stage completed");
                Ok(RunOutcome::Completed)
            }
            Err(failure) => {
                let code = failure.code();
                warn!(code = code.as_str(), error = %failure.message(), "stage failed");
                Ok(self.failed(job, code, &failure.message()).await)
            }
        }
    }

    async fn complete(&self, job: &Job, produced: Produced) -> Result<(), PipelineError> {
        let (result, done) = match produced {
            Produced::Text { text, usage } => (
                json!({"text": text}),
                EventBody::Done {
                    text: Some(text),
                    data: None,
                    usage: Some(usage),
                },
            ),
            Produced::Structured { data, usage } => {
                if let Some(result_event) = EventBody::stage_result(job.stage, data.clone()) {
                    self.emit(job, result_event).await?;
                }
                (
                    data.clone(),
                    EventBody::Done {
                        text: None,
                        data: Some(data),
                        usage: Some(usage),
                    },
                )
            }
        };

        self.ports
            .stages
            .persist(job.task_id(), Some(result), StageStatus::Completed)
            .await?;

        if let Some(next) = self.ports.stages.advance(job.task_id()).await? {
            let next_phase = job
                .stage
                .phase()
                .and_then(|phase| phase.next(job.invocation.tier()))
                .or_else(|| next.phase_hint());
            if let Some(phase) = next_phase {
                info!(next_task_id = %next, "handing off to next stage");
                self.publish(job, Event::status(next, PipelineStatus::at(phase, StageStatus::Pending)))
                    .await?;
            }
        }

        self.emit(job, done).await?;
        Ok(())
    }

    /// Publish the failure, mark the stage failed and refund.
    ///
    /// Ladder stages get a plain `error` followed by the terminal
    /// `{PHASE}_FAILED` status; other stages get one terminal `error`.
    async fn fail(&self, job: &Job, code: WorkerErrorCode, message: &str) -> Result<(), StoreError> {
        match job.stage.phase() {
            Some(phase) => {
                self.emit(
                    job,
                    EventBody::Error {
                        message: message.to_string(),
                        code: Some(code.as_str().to_string()),
                        stage: None,
                    },
                )
                .await?;
                self.emit(job, failed_status(phase, code)).await?;
            }
            None => {
                self.emit(
                    job,
                    EventBody::Error {
                        message: message.to_string(),
                        code: Some(code.as_str().to_string()),
                        stage: Some(ErrorStage::Terminal),
                    },
                )
                .await?;
            }
        }

        if let Err(err) = self
            .ports
            .stages
            .persist(job.task_id(), None, StageStatus::Failed)
            .await
        {
            warn!(error = %err, "failed to mark stage failed");
        }
        self.refund(job, code).await;
        Ok(())
    }

    /// Report a failure exactly once. A publish error is handed back as
    /// the outcome rather than retried here.
    async fn failed(&self, job: &Job, code: WorkerErrorCode, message: &str) -> RunOutcome {
        match self.fail(job, code, message).await {
            Ok(()) => RunOutcome::Failed(code),
            Err(err) => RunOutcome::Unreported(err),
        }
    }

    async fn refund(&self, job: &Job, code: WorkerErrorCode) {
        let Some(debit_id) = &job.invocation.debit_id else {
            return;
        };
        match self.ports.ledger.refund(debit_id, code.as_str()).await {
            Ok(outcome) => info!(%debit_id, ?outcome, "refund issued"),
            Err(err) => warn!(%debit_id, error = %err, "refund failed"),
        }
    }

    async fn emit(&self, job: &Job, body: EventBody) -> Result<(), StoreError> {
        self.publish(job, Event::for_task(job.task_id().clone(), body)).await
    }

    async fn publish(&self, job: &Job, event: Event) -> Result<(), StoreError> {
        self.ports.publisher.publish(&job.channel, event).await?;
        Ok(())
    }
}

fn failed_status(phase: Phase, code: WorkerErrorCode) -> EventBody {
    EventBody::Status {
        status: PipelineStatus::at(phase, StageStatus::Failed),
        code: None,
        failure_code: Some(code.as_str().to_string()),
    }
}
