//! Stream and structured execution against a provider.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::schema::{SchemaError, parse_structured};
use super::{Job, Worker};
use crate::domain::{ChannelKey, Event, EventBody, TaskId, Usage, WorkerErrorCode};
use crate::error::StoreError;
use crate::ports::{ModelProvider, ProviderError, TokenSink};
use crate::publisher::EventPublisher;

pub(super) const STREAM_IDLE: &str = "stream_idle";

/// What a successful execution produced.
pub(super) enum Produced {
    Text { text: String, usage: Usage },
    Structured { data: Value, usage: Usage },
}

pub(super) enum ExecFailure {
    Provider(ProviderError),
    Schema(SchemaError),
    Store(StoreError),
}

impl ExecFailure {
    pub(super) fn code(&self) -> WorkerErrorCode {
        match self {
            ExecFailure::Provider(ProviderError::Sink(_)) | ExecFailure::Store(_) => {
                WorkerErrorCode::InternalError
            }
            ExecFailure::Provider(_) => WorkerErrorCode::LlmError,
            ExecFailure::Schema(_) => WorkerErrorCode::StructuredError,
        }
    }

    pub(super) fn message(&self) -> String {
        match self {
            ExecFailure::Provider(err) => err.to_string(),
            ExecFailure::Schema(err) => err.to_string(),
            ExecFailure::Store(err) => err.to_string(),
        }
    }
}

impl From<StoreError> for ExecFailure {
    fn from(err: StoreError) -> Self {
        ExecFailure::Store(err)
    }
}

/// Publishes every token on the task's channel and counts them.
struct ChannelSink<'a> {
    publisher: &'a EventPublisher,
    channel: &'a ChannelKey,
    task_id: &'a TaskId,
    tokens: AtomicUsize,
}

impl ChannelSink<'_> {
    fn tokens(&self) -> usize {
        self.tokens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSink for ChannelSink<'_> {
    async fn on_token(&self, text: &str) -> Result<(), StoreError> {
        self.tokens.fetch_add(1, Ordering::SeqCst);
        let event = Event::for_task(
            self.task_id.clone(),
            EventBody::Token {
                text: text.to_string(),
            },
        );
        self.publisher.publish(self.channel, event).await?;
        Ok(())
    }
}

impl Worker {
    /// Relay tokens as they arrive. If nothing arrives within the idle
    /// threshold, an `info{stream_idle}` notice goes out once.
    pub(super) async fn execute_stream(
        &self,
        job: &Job,
        provider: &dyn ModelProvider,
    ) -> Result<Produced, ExecFailure> {
        let sink = ChannelSink {
            publisher: &self.ports.publisher,
            channel: &job.channel,
            task_id: job.task_id(),
            tokens: AtomicUsize::new(0),
        };
        let request = job.completion_request();

        let stream = provider.stream(&request, &sink);
        tokio::pin!(stream);
        let watchdog = tokio::time::sleep(self.idle_threshold);
        tokio::pin!(watchdog);
        let mut watching = true;
        let mut idle_sent = false;

        let completion = loop {
            tokio::select! {
                result = &mut stream => break result,
                _ = &mut watchdog, if watching => {
                    watching = false;
                    if sink.tokens() == 0 {
                        self.publish_idle(job).await?;
                        idle_sent = true;
                    }
                }
            }
        };
        let completion = completion.map_err(ExecFailure::Provider)?;

        if sink.tokens() == 0 && !idle_sent {
            self.publish_idle(job).await?;
        }
        Ok(Produced::Text {
            text: completion.text,
            usage: completion.usage,
        })
    }

    /// One completion, validated against the stage's schema.
    pub(super) async fn execute_structured(
        &self,
        job: &Job,
        provider: &dyn ModelProvider,
    ) -> Result<Produced, ExecFailure> {
        let completion = provider
            .complete(&job.completion_request())
            .await
            .map_err(ExecFailure::Provider)?;
        let data = parse_structured(job.stage, &completion.text).map_err(ExecFailure::Schema)?;
        Ok(Produced::Structured {
            data,
            usage: completion.usage,
        })
    }

    async fn publish_idle(&self, job: &Job) -> Result<(), StoreError> {
        info!(threshold_ms = self.idle_threshold.as_millis() as u64, "no tokens yet");
        self.emit(
            job,
            EventBody::Info {
                code: STREAM_IDLE.to_string(),
            },
        )
        .await
    }
}
