//! Pipeline configuration.
//!
//! Every field has a serde default, so a config file only needs to name what
//! it overrides. Durations are stored as integer milliseconds or seconds and
//! exposed through `Duration` accessors.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionKind, Modality, Stage, Tier};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub environment: Environment,

    /// Base URL the queue delivers to; the worker path is appended.
    #[serde(default = "default_worker_base_url")]
    pub worker_base_url: String,

    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub guards: GuardConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

fn default_worker_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            worker_base_url: default_worker_base_url(),
            admission: AdmissionConfig::default(),
            backpressure: BackpressureConfig::default(),
            guards: GuardConfig::default(),
            publisher: PublisherConfig::default(),
            gateway: GatewayConfig::default(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            client: ClientConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }
}

// ============================================================================
// Admission
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Requests per user per rate window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u64,

    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Daily cap for the free tier.
    #[serde(default = "default_daily_limit_free")]
    pub daily_limit_free: u64,

    /// Steps (stage names) that are de-duplicated by request body.
    #[serde(default = "default_idempotent_steps")]
    pub idempotent_steps: Vec<String>,

    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Retry-After sent with a backpressure rejection.
    #[serde(default = "default_backpressure_retry_after_secs")]
    pub backpressure_retry_after_secs: u64,
}

const fn default_rate_limit() -> u64 {
    30
}

const fn default_rate_window_secs() -> u64 {
    60
}

const fn default_daily_limit_free() -> u64 {
    20
}

fn default_idempotent_steps() -> Vec<String> {
    ["vision", "ocr", "summary", "prematch", "match"]
        .into_iter()
        .map(String::from)
        .collect()
}

const fn default_idempotency_ttl_secs() -> u64 {
    600
}

const fn default_backpressure_retry_after_secs() -> u64 {
    5
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            rate_window_secs: default_rate_window_secs(),
            daily_limit_free: default_daily_limit_free(),
            idempotent_steps: default_idempotent_steps(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            backpressure_retry_after_secs: default_backpressure_retry_after_secs(),
        }
    }
}

impl AdmissionConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn backpressure_retry_after(&self) -> Duration {
        Duration::from_secs(self.backpressure_retry_after_secs)
    }

    pub fn is_idempotent_step(&self, step: &str) -> bool {
        self.idempotent_steps.iter().any(|s| s == step)
    }
}

/// Max pending deliveries per routing queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_free_text")]
    pub free_text: u64,
    #[serde(default = "default_free_vision")]
    pub free_vision: u64,
    #[serde(default = "default_paid_text")]
    pub paid_text: u64,
    #[serde(default = "default_paid_vision")]
    pub paid_vision: u64,
}

const fn default_free_text() -> u64 {
    50
}

const fn default_free_vision() -> u64 {
    20
}

const fn default_paid_text() -> u64 {
    200
}

const fn default_paid_vision() -> u64 {
    80
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            free_text: default_free_text(),
            free_vision: default_free_vision(),
            paid_text: default_paid_text(),
            paid_vision: default_paid_vision(),
        }
    }
}

impl BackpressureConfig {
    pub fn max_pending(&self, tier: Tier, modality: Modality) -> u64 {
        match (tier, modality) {
            (Tier::Free, Modality::Text) => self.free_text,
            (Tier::Free, Modality::Vision) => self.free_vision,
            (Tier::Paid, Modality::Text) => self.paid_text,
            (Tier::Paid, Modality::Vision) => self.paid_vision,
        }
    }
}

// ============================================================================
// Worker guards
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Concurrent executions per user per kind.
    #[serde(default = "default_user_max")]
    pub user_max: u64,

    #[serde(default = "default_model_max_free")]
    pub model_max_free: u64,

    #[serde(default = "default_model_max_paid")]
    pub model_max_paid: u64,

    /// Guard counters expire after this long, so a crashed holder cannot
    /// pin capacity forever.
    #[serde(default = "default_guard_ttl_secs")]
    pub ttl_secs: u64,

    /// Upper bound for the Retry-After sent when a guard is full.
    #[serde(default = "default_guard_retry_after_secs")]
    pub retry_after_secs: u64,
}

const fn default_user_max() -> u64 {
    2
}

const fn default_model_max_free() -> u64 {
    8
}

const fn default_model_max_paid() -> u64 {
    32
}

const fn default_guard_ttl_secs() -> u64 {
    300
}

const fn default_guard_retry_after_secs() -> u64 {
    3
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            user_max: default_user_max(),
            model_max_free: default_model_max_free(),
            model_max_paid: default_model_max_paid(),
            ttl_secs: default_guard_ttl_secs(),
            retry_after_secs: default_guard_retry_after_secs(),
        }
    }
}

impl GuardConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }

    pub fn model_max(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Free => self.model_max_free,
            Tier::Paid => self.model_max_paid,
        }
    }
}

// ============================================================================
// Publisher / gateway
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Flush as soon as this many fragments are buffered.
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,

    /// Log retention once a channel has seen its terminal event.
    #[serde(default = "default_terminal_ttl_secs")]
    pub terminal_ttl_secs: u64,

    #[serde(default = "default_max_log_len")]
    pub max_log_len: usize,
}

const fn default_debounce_ms() -> u64 {
    50
}

const fn default_max_batch_tokens() -> usize {
    16
}

const fn default_terminal_ttl_secs() -> u64 {
    3600
}

const fn default_max_log_len() -> usize {
    1000
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_batch_tokens: default_max_batch_tokens(),
            terminal_ttl_secs: default_terminal_ttl_secs(),
            max_log_len: default_max_log_len(),
        }
    }
}

impl PublisherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn terminal_ttl(&self) -> Duration {
        Duration::from_secs(self.terminal_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_poll_min_ms")]
    pub poll_min_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Close a connection that has relayed nothing for this long.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Max entries per log read.
    #[serde(default = "default_read_batch")]
    pub read_batch: usize,
}

const fn default_poll_min_ms() -> u64 {
    100
}

const fn default_poll_max_ms() -> u64 {
    2000
}

const fn default_keepalive_secs() -> u64 {
    15
}

const fn default_idle_timeout_secs() -> u64 {
    600
}

const fn default_channel_capacity() -> usize {
    64
}

const fn default_read_batch() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poll_min_ms: default_poll_min_ms(),
            poll_max_ms: default_poll_max_ms(),
            keepalive_secs: default_keepalive_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            channel_capacity: default_channel_capacity(),
            read_batch: default_read_batch(),
        }
    }
}

impl GatewayConfig {
    pub fn poll_min(&self) -> Duration {
        Duration::from_millis(self.poll_min_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ============================================================================
// Worker / queue / client
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// A stream that produced no token by now gets a `stream_idle` notice.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    /// A run still going after this long is failed and refunded.
    #[serde(default = "default_execution_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_idle_threshold_ms() -> u64 {
    8000
}

const fn default_execution_timeout_secs() -> u64 {
    120
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
            timeout_secs: default_execution_timeout_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Dispatcher loops that pull deliveries and hand them to the worker.
    #[serde(default = "default_dispatchers")]
    pub dispatchers: usize,
    /// Succeeded and dead records kept for inspection; older ones are pruned.
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    2000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_dispatchers() -> usize {
    4
}

const fn default_retain_finished() -> usize {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            dispatchers: default_dispatchers(),
            retain_finished: default_retain_finished(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Manual reconnect fires if native resumption has not reconnected by then.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Delay between receiving content and making it visible.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

const fn default_reconnect_delay_ms() -> u64 {
    3000
}

const fn default_flush_interval_ms() -> u64 {
    50
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Which stage a template runs and how it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRoute {
    pub stage: Stage,
    pub kind: ExecutionKind,
}

/// Model ids per tier for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChoice {
    pub free: String,
    pub paid: String,
}

impl ModelChoice {
    pub fn for_tier(&self, tier: Tier) -> &str {
        match tier {
            Tier::Free => &self.free,
            Tier::Paid => &self.paid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_templates")]
    pub templates: BTreeMap<String, TemplateRoute>,
    #[serde(default = "default_models")]
    pub models: BTreeMap<Stage, ModelChoice>,
}

fn default_templates() -> BTreeMap<String, TemplateRoute> {
    use ExecutionKind::{Batch, Stream};
    [
        ("job_summary", Stage::Vision, Stream),
        ("job_vision", Stage::Vision, Stream),
        ("ocr", Stage::Ocr, Batch),
        ("summary", Stage::Summary, Batch),
        ("prematch", Stage::Prematch, Stream),
        ("match", Stage::Match, Batch),
        ("customize", Stage::Customize, Stream),
        ("interview", Stage::Interview, Stream),
    ]
    .into_iter()
    .map(|(name, stage, kind)| (name.to_string(), TemplateRoute { stage, kind }))
    .collect()
}

fn default_models() -> BTreeMap<Stage, ModelChoice> {
    [
        Stage::Vision,
        Stage::Ocr,
        Stage::Summary,
        Stage::Prematch,
        Stage::Match,
        Stage::Customize,
        Stage::Interview,
    ]
    .into_iter()
    .map(|stage| {
        let choice = match stage.default_modality() {
            Modality::Vision => ModelChoice {
                free: "vision-lite".into(),
                paid: "vision-pro".into(),
            },
            Modality::Text => ModelChoice {
                free: "text-lite".into(),
                paid: "text-pro".into(),
            },
        };
        (stage, choice)
    })
    .collect()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            templates: default_templates(),
            models: default_models(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = PipelineConfig::from_json_str("{}").unwrap();

        assert!(config.is_development());
        assert_eq!(config.admission.rate_limit, 30);
        assert_eq!(config.publisher.debounce(), Duration::from_millis(50));
        assert_eq!(config.gateway.poll_max(), Duration::from_secs(2));
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.retain_finished, 1000);
        assert_eq!(config.worker.timeout(), Duration::from_secs(120));
        assert!(config.routing.templates.contains_key("job_summary"));
    }

    #[test]
    fn partial_section_overrides_only_named_fields() {
        let config = PipelineConfig::from_json_str(
            r#"{"environment": "production", "publisher": {"max_batch_tokens": 4}}"#,
        )
        .unwrap();

        assert!(!config.is_development());
        assert_eq!(config.publisher.max_batch_tokens, 4);
        assert_eq!(config.publisher.debounce_ms, 50);
    }

    #[test]
    fn backpressure_limits_by_tier_and_modality() {
        let bp = BackpressureConfig::default();
        assert_eq!(bp.max_pending(Tier::Free, Modality::Vision), 20);
        assert_eq!(bp.max_pending(Tier::Paid, Modality::Text), 200);
    }

    #[test]
    fn every_default_template_stage_has_models() {
        let routing = RoutingConfig::default();
        for route in routing.templates.values() {
            assert!(routing.models.contains_key(&route.stage));
        }
    }
}
