//! Admission Controller: decides whether a task may be enqueued.
//!
//! Checks run in a fixed order and stop at the first rejection:
//! daily limit (free tier only), per-user rate limit, idempotency, queue
//! backpressure. Every request ends in exactly one [`AdmissionDecision`],
//! which is audited. Rejections of pre-paid tasks are refunded.
//!
//! Backpressure takes a permit on the routing queue's pending counter. The
//! permit travels with the task and the worker gives it back once a
//! delivery settles the task.

mod idempotency;
mod limits;

pub use idempotency::idempotency_key;
pub use limits::{daily_key, rate_key, until_utc_midnight};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{Instrument, error, info, warn};

use crate::config::{AdmissionConfig, BackpressureConfig, PipelineConfig};
use crate::domain::{
    AdmissionCode, DebitId, MessageId, Modality, RoutingTable, TaskId, TaskInvocation, Tier,
    pending_key, routing::parse_queue_id,
};
use crate::error::PipelineError;
use crate::observability::admission_span;
use crate::ports::{
    AnalyticsEvent, AnalyticsSink, AuditRecord, AuditSink, BoundedIncr, Clock, CounterStore,
    IdGenerator, LockOutcome, RefundLedger,
};
use crate::queue::{Delivery, EnqueueOptions, TaskQueue};
use limits::retry_hint;

/// A caller's request to run one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Generated from the template's stage when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub service_id: String,
    pub user_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub template_id: String,
    #[serde(default = "default_variables")]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub has_quota: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debit_id: Option<DebitId>,
}

fn default_locale() -> String {
    "en".to_string()
}

fn default_variables() -> serde_json::Value {
    json!({})
}

impl AdmissionRequest {
    pub fn tier(&self) -> Tier {
        Tier::from_quota(self.has_quota)
    }

    /// The part of the request that identifies "the same request" for
    /// idempotency purposes.
    fn idempotent_body(&self) -> serde_json::Value {
        json!({
            "serviceId": self.service_id,
            "templateId": self.template_id,
            "locale": self.locale,
            "variables": self.variables,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Accepted {
        message_id: MessageId,
        task_id: TaskId,
    },
    /// Identical request already admitted; points at the original task.
    Replay { task_id: TaskId },
    RateLimited {
        code: AdmissionCode,
        retry_after: Duration,
    },
    Backpressured { retry_after: Duration },
    Error { code: AdmissionCode },
}

impl AdmissionDecision {
    pub fn code(&self) -> AdmissionCode {
        match self {
            AdmissionDecision::Accepted { .. } => AdmissionCode::Accepted,
            AdmissionDecision::Replay { .. } => AdmissionCode::IdempotentReplay,
            AdmissionDecision::RateLimited { code, .. } => *code,
            AdmissionDecision::Backpressured { .. } => AdmissionCode::Backpressured,
            AdmissionDecision::Error { code } => *code,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionDecision::RateLimited { retry_after, .. }
            | AdmissionDecision::Backpressured { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Rejections give the caller's debit back. Replays do not: the original
    /// admission owns the debit.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AdmissionDecision::RateLimited { .. }
                | AdmissionDecision::Backpressured { .. }
                | AdmissionDecision::Error { .. }
        )
    }

    fn message_id(&self) -> Option<MessageId> {
        match self {
            AdmissionDecision::Accepted { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

/// Collaborators the controller talks to.
#[derive(Clone)]
pub struct AdmissionPorts {
    pub counters: Arc<dyn CounterStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub routing: Arc<RoutingTable>,
    pub ledger: Arc<dyn RefundLedger>,
    pub audit: Arc<dyn AuditSink>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AdmissionController {
    ports: AdmissionPorts,
    config: AdmissionConfig,
    backpressure: BackpressureConfig,
    permit_ttl: Duration,
    worker_base_url: String,
}

impl AdmissionController {
    pub fn new(ports: AdmissionPorts, config: &PipelineConfig) -> Self {
        Self {
            ports,
            config: config.admission.clone(),
            backpressure: config.backpressure.clone(),
            permit_ttl: config.guards.ttl(),
            worker_base_url: config.worker_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn admit(&self, request: AdmissionRequest) -> AdmissionDecision {
        let task_id = match &request.task_id {
            Some(task_id) => task_id.clone(),
            None => match self.ports.routing.stage(&request.template_id) {
                Ok(stage) => self.ports.ids.generate_task_id(stage),
                Err(_) => TaskId::new(self.ports.ids.generate_message_id().to_string()),
            },
        };
        let span = admission_span(task_id.as_str(), &request.user_id, &request.template_id);

        async {
            let decision = match self.evaluate(&request, &task_id).await {
                Ok(decision) => decision,
                Err(err) => {
                    error!(error = %err, "admission check failed");
                    AdmissionDecision::Error {
                        code: AdmissionCode::InternalError,
                    }
                }
            };

            if decision.is_rejection() {
                self.refund(&request, decision.code()).await;
            }
            self.report(&request, &task_id, &decision).await;
            decision
        }
        .instrument(span)
        .await
    }

    /// Put a copy of `invocation` back on the queue after `delay`, with one
    /// more retry counted. The copy counts as pending even over capacity.
    pub async fn requeue(
        &self,
        invocation: &TaskInvocation,
        delay: Duration,
    ) -> Result<MessageId, PipelineError> {
        let invocation = invocation.requeued(self.ports.clock.now());
        let url = self.worker_url(&invocation.template_id, &invocation.service_id)?;
        let routing = self.ports.routing.decide(
            &invocation.template_id,
            &invocation.variables,
            invocation.has_quota,
        )?;
        let permit = pending_key(&routing.queue_id);
        self.ports
            .counters
            .incr_bounded(&permit, u64::MAX, self.permit_ttl)
            .await?;
        let enqueued = self
            .ports
            .queue
            .enqueue(Delivery { url, invocation: invocation.clone() }, EnqueueOptions::delayed(delay))
            .await;
        let message_id = match enqueued {
            Ok(message_id) => message_id,
            Err(err) => {
                self.return_permit(&permit).await;
                return Err(err.into());
            }
        };
        info!(
            task_id = %invocation.task_id,
            retry_count = invocation.retry_count,
            delay_ms = delay.as_millis() as u64,
            "task requeued"
        );
        Ok(message_id)
    }

    pub fn worker_url(&self, template_id: &str, service_id: &str) -> Result<String, PipelineError> {
        let kind = self.ports.routing.kind(template_id)?;
        Ok(format!("{}/worker/{kind}/{service_id}", self.worker_base_url))
    }

    async fn evaluate(
        &self,
        request: &AdmissionRequest,
        task_id: &TaskId,
    ) -> Result<AdmissionDecision, PipelineError> {
        let counters = &self.ports.counters;
        let now = self.ports.clock.now();

        if request.tier() == Tier::Free {
            let window = counters
                .incr_window(&daily_key(Tier::Free, &request.user_id, now), until_utc_midnight(now))
                .await?;
            if window.count > self.config.daily_limit_free {
                return Ok(AdmissionDecision::RateLimited {
                    code: AdmissionCode::DailyLimitExceeded,
                    retry_after: retry_hint(window.remaining),
                });
            }
        }

        let window = counters
            .incr_window(&rate_key(&request.user_id), self.config.rate_window())
            .await?;
        if window.count > self.config.rate_limit {
            return Ok(AdmissionDecision::RateLimited {
                code: AdmissionCode::RateLimited,
                retry_after: retry_hint(window.remaining),
            });
        }

        let stage = self.ports.routing.stage(&request.template_id)?;
        let idempotency_lock = if self.config.is_idempotent_step(stage.as_str()) {
            let key = idempotency_key(&request.user_id, stage.as_str(), &request.idempotent_body());
            match counters
                .acquire_lock(&key, task_id.as_str(), self.config.idempotency_ttl())
                .await?
            {
                LockOutcome::Acquired => Some(key),
                LockOutcome::Held { holder } => {
                    return Ok(AdmissionDecision::Replay {
                        task_id: TaskId::new(holder),
                    });
                }
            }
        } else {
            None
        };

        let outcome = self.enqueue_checked(request, task_id).await;

        let admitted = matches!(outcome, Ok(AdmissionDecision::Accepted { .. }));
        if let (false, Some(key)) = (admitted, idempotency_lock) {
            if let Err(err) = counters.release_lock(&key, task_id.as_str()).await {
                warn!(error = %err, "failed to release idempotency record");
            }
        }
        outcome
    }

    async fn enqueue_checked(
        &self,
        request: &AdmissionRequest,
        task_id: &TaskId,
    ) -> Result<AdmissionDecision, PipelineError> {
        let routing = self
            .ports
            .routing
            .decide(&request.template_id, &request.variables, request.has_quota)?;

        let url = self.worker_url(&request.template_id, &request.service_id)?;
        let invocation = TaskInvocation {
            task_id: task_id.clone(),
            service_id: request.service_id.clone(),
            user_id: request.user_id.clone(),
            locale: request.locale.clone(),
            template_id: request.template_id.clone(),
            variables: request.variables.clone(),
            enqueued_at: self.ports.clock.now(),
            retry_count: 0,
            has_quota: request.has_quota,
            debit_id: request.debit_id.clone(),
        };

        let (tier, modality) = parse_queue_id(&routing.queue_id)
            .unwrap_or((request.tier(), Modality::Text));
        let permit = pending_key(&routing.queue_id);
        let max = self.backpressure.max_pending(tier, modality);
        if let BoundedIncr::AtCapacity { value, .. } = self
            .ports
            .counters
            .incr_bounded(&permit, max, self.permit_ttl)
            .await?
        {
            info!(queue_id = %routing.queue_id, pending = value, max, "queue backpressured");
            return Ok(AdmissionDecision::Backpressured {
                retry_after: self.config.backpressure_retry_after(),
            });
        }

        match self
            .ports
            .queue
            .enqueue(Delivery { url, invocation }, EnqueueOptions::default())
            .await
        {
            Ok(message_id) => Ok(AdmissionDecision::Accepted {
                message_id,
                task_id: task_id.clone(),
            }),
            Err(err) => {
                error!(error = %err, "enqueue failed");
                self.return_permit(&permit).await;
                Ok(AdmissionDecision::Error {
                    code: AdmissionCode::EnqueueFailed,
                })
            }
        }
    }

    async fn return_permit(&self, permit: &str) {
        if let Err(err) = self.ports.counters.decr(permit).await {
            warn!(%permit, error = %err, "failed to return queue permit");
        }
    }

    async fn refund(&self, request: &AdmissionRequest, code: AdmissionCode) {
        let Some(debit_id) = &request.debit_id else {
            return;
        };
        match self.ports.ledger.refund(debit_id, code.as_str()).await {
            Ok(outcome) => info!(%debit_id, ?outcome, "refund issued"),
            Err(err) => warn!(%debit_id, error = %err, "refund failed"),
        }
    }

    async fn report(&self, request: &AdmissionRequest, task_id: &TaskId, decision: &AdmissionDecision) {
        let code = decision.code();
        info!(code = code.as_str(), "admission decided");

        let record = AuditRecord {
            task_id: task_id.clone(),
            user_id: request.user_id.clone(),
            code,
            message_id: decision.message_id().map(|id| id.to_string()),
            retry_after_secs: decision.retry_after().map(|d| d.as_secs()),
            at: self.ports.clock.now(),
        };
        if let Err(err) = self.ports.audit.record(record).await {
            warn!(error = %err, "audit write failed");
        }

        let analytics = Arc::clone(&self.ports.analytics);
        let event = AnalyticsEvent {
            name: "task_admission".to_string(),
            user_id: request.user_id.clone(),
            properties: json!({
                "taskId": task_id,
                "templateId": request.template_id,
                "tier": request.tier().as_str(),
                "code": code,
            }),
        };
        tokio::spawn(async move {
            if let Err(err) = analytics.track(event).await {
                warn!(error = %err, "analytics delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::impls::{InMemoryAuditLog, InMemoryCounterStore, InMemoryRefundLedger};
    use crate::observability::QueueCounts;
    use crate::ports::{ManualClock, UlidGenerator};
    use crate::queue::{DeliveryLease, InMemoryTaskQueue, QueueError, RetryPolicy};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct Harness {
        controller: AdmissionController,
        counters: InMemoryCounterStore,
        queue: Arc<InMemoryTaskQueue>,
        ledger: InMemoryRefundLedger,
        audit: InMemoryAuditLog,
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
    }

    fn harness_with(config: PipelineConfig, queue: Option<Arc<dyn TaskQueue>>) -> Harness {
        let clock = clock();
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let counters = InMemoryCounterStore::new(Arc::new(clock.clone()));
        let memory_queue = Arc::new(InMemoryTaskQueue::new(RetryPolicy::default(), Arc::clone(&ids)));
        let ledger = InMemoryRefundLedger::new();
        let audit = InMemoryAuditLog::new();
        let ports = AdmissionPorts {
            counters: Arc::new(counters.clone()),
            queue: queue.unwrap_or_else(|| memory_queue.clone()),
            routing: Arc::new(RoutingTable::new(RoutingConfig::default())),
            ledger: Arc::new(ledger.clone()),
            audit: Arc::new(audit.clone()),
            analytics: Arc::new(audit.clone()),
            ids,
            clock: Arc::new(clock),
        };
        Harness {
            controller: AdmissionController::new(ports, &config),
            counters,
            queue: memory_queue,
            ledger,
            audit,
        }
    }

    fn harness() -> Harness {
        harness_with(PipelineConfig::default(), None)
    }

    fn request(template: &str) -> AdmissionRequest {
        AdmissionRequest {
            task_id: None,
            service_id: "jobs".into(),
            user_id: "u1".into(),
            locale: "en".into(),
            template_id: template.into(),
            variables: json!({"jobId": "j-1"}),
            has_quota: true,
            debit_id: Some(DebitId::new("debit-1")),
        }
    }

    #[tokio::test]
    async fn accepted_task_is_enqueued_with_worker_url() {
        let h = harness();

        let decision = h.controller.admit(request("summary")).await;

        let AdmissionDecision::Accepted { message_id, task_id } = decision else {
            panic!("expected accepted, got {decision:?}");
        };
        assert_eq!(task_id.phase_hint(), Some(crate::domain::Phase::Summary));
        let record = h.queue.record(message_id).await.unwrap();
        assert_eq!(record.delivery.url, "http://127.0.0.1:8080/worker/batch/jobs");
        assert_eq!(record.delivery.invocation.task_id, task_id);
        assert_eq!(record.delivery.invocation.debit_id, Some(DebitId::new("debit-1")));
        assert!(h.ledger.refunds().is_empty());
        assert_eq!(h.audit.records()[0].code, AdmissionCode::Accepted);
        assert_eq!(h.counters.get("pending:paid-text").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn identical_request_is_a_replay_without_second_enqueue() {
        let h = harness();

        let first = h.controller.admit(request("summary")).await;
        let second = h.controller.admit(request("summary")).await;

        let AdmissionDecision::Accepted { task_id, .. } = first else {
            panic!("expected accepted, got {first:?}");
        };
        assert_eq!(second, AdmissionDecision::Replay { task_id });
        assert_eq!(h.queue.counts().await.unwrap().queued, 1);
        assert!(h.ledger.refunds().is_empty());
    }

    #[tokio::test]
    async fn steps_outside_the_idempotent_set_are_not_deduplicated() {
        let h = harness();

        h.controller.admit(request("customize")).await;
        let second = h.controller.admit(request("customize")).await;

        assert!(matches!(second, AdmissionDecision::Accepted { .. }));
        assert_eq!(h.queue.counts().await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn full_queue_is_backpressured_and_refunded() {
        let h = harness();
        for _ in 0..200 {
            h.counters
                .incr_bounded("pending:paid-text", 1000, Duration::from_secs(60))
                .await
                .unwrap();
        }

        let decision = h.controller.admit(request("summary")).await;

        assert_eq!(
            decision,
            AdmissionDecision::Backpressured {
                retry_after: Duration::from_secs(5)
            }
        );
        assert_eq!(
            h.ledger.refunds(),
            vec![(DebitId::new("debit-1"), "backpressured".to_string())]
        );
        assert_eq!(h.queue.counts().await.unwrap(), QueueCounts::default());

        // The idempotency record was released, so a retry is admitted.
        for _ in 0..200 {
            h.counters.decr("pending:paid-text").await.unwrap();
        }
        assert!(matches!(
            h.controller.admit(request("summary")).await,
            AdmissionDecision::Accepted { .. }
        ));
    }

    #[tokio::test]
    async fn burst_is_admitted_only_up_to_queue_capacity() {
        let mut config = PipelineConfig::default();
        config.backpressure.paid_text = 3;
        let h = harness_with(config, None);

        let mut accepted = 0;
        let mut backpressured = 0;
        for _ in 0..10 {
            let unpaid = AdmissionRequest {
                debit_id: None,
                ..request("customize")
            };
            match h.controller.admit(unpaid).await {
                AdmissionDecision::Accepted { .. } => accepted += 1,
                AdmissionDecision::Backpressured { .. } => backpressured += 1,
                other => panic!("unexpected decision {other:?}"),
            }
        }

        assert_eq!((accepted, backpressured), (3, 7));
        assert_eq!(h.queue.counts().await.unwrap().queued, 3);
        assert_eq!(h.counters.get("pending:paid-text").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rate_limit_rejects_past_the_window_budget() {
        let mut config = PipelineConfig::default();
        config.admission.rate_limit = 2;
        let h = harness_with(config, None);

        h.controller.admit(request("customize")).await;
        h.controller.admit(request("customize")).await;
        let third = h.controller.admit(request("customize")).await;

        assert_eq!(third.code(), AdmissionCode::RateLimited);
        assert_eq!(third.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(h.ledger.refunds().len(), 1);
    }

    #[tokio::test]
    async fn daily_limit_applies_to_free_tier_only() {
        let mut config = PipelineConfig::default();
        config.admission.daily_limit_free = 1;
        let h = harness_with(config, None);
        let free = AdmissionRequest {
            has_quota: false,
            debit_id: None,
            ..request("customize")
        };

        assert!(matches!(
            h.controller.admit(free.clone()).await,
            AdmissionDecision::Accepted { .. }
        ));
        let second = h.controller.admit(free).await;
        assert_eq!(second.code(), AdmissionCode::DailyLimitExceeded);
        // Noon to midnight.
        assert_eq!(second.retry_after(), Some(Duration::from_secs(12 * 3600)));
        assert!(h.ledger.refunds().is_empty());

        assert!(matches!(
            h.controller.admit(request("customize")).await,
            AdmissionDecision::Accepted { .. }
        ));
    }

    struct BrokenQueue;

    #[async_trait]
    impl TaskQueue for BrokenQueue {
        async fn enqueue(&self, _: Delivery, _: EnqueueOptions) -> Result<MessageId, QueueError> {
            Err(QueueError::Closed)
        }

        async fn lease(&self) -> Option<Box<dyn DeliveryLease>> {
            None
        }

        async fn counts(&self) -> Result<QueueCounts, QueueError> {
            Ok(QueueCounts::default())
        }
    }

    #[tokio::test]
    async fn enqueue_failure_reports_error_and_refunds() {
        let h = harness_with(PipelineConfig::default(), Some(Arc::new(BrokenQueue)));

        let decision = h.controller.admit(request("summary")).await;

        assert_eq!(
            decision,
            AdmissionDecision::Error {
                code: AdmissionCode::EnqueueFailed
            }
        );
        assert_eq!(h.ledger.refunds().len(), 1);
        assert_eq!(h.audit.records()[0].code, AdmissionCode::EnqueueFailed);
        assert_eq!(h.counters.get("pending:paid-text").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_template_is_an_internal_error() {
        let h = harness();
        let decision = h.controller.admit(request("no_such_template")).await;
        assert_eq!(decision.code(), AdmissionCode::InternalError);
        assert_eq!(h.ledger.refunds().len(), 1);
    }

    #[tokio::test]
    async fn requeue_bumps_retry_count_and_delays() {
        let h = harness();
        let AdmissionDecision::Accepted { message_id, .. } = h.controller.admit(request("summary")).await
        else {
            panic!("expected accepted");
        };
        let original = h.queue.record(message_id).await.unwrap().delivery.invocation;

        let requeued = h
            .controller
            .requeue(&original, Duration::from_secs(10))
            .await
            .unwrap();

        let record = h.queue.record(requeued).await.unwrap();
        assert_eq!(record.delivery.invocation.retry_count, 1);
        assert_eq!(h.queue.counts().await.unwrap().scheduled, 1);
        assert_eq!(h.counters.get("pending:paid-text").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn analytics_is_delivered_in_the_background() {
        let h = harness();
        h.controller.admit(request("summary")).await;
        for _ in 0..10 {
            if !h.audit.events().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.audit.events().len(), 1);
        assert_eq!(h.audit.events()[0].name, "task_admission");
    }
}
