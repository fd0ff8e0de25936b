//! ModelProvider port.
//!
//! Prompt construction and vendor SDKs live behind this trait. The worker
//! only needs two call shapes: a token stream with a per-token callback, and
//! a single completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Stage, Usage};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model_id: String,
    pub stage: Stage,
    pub template_id: String,
    pub locale: String,
    pub variables: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("provider timed out")]
    Timeout,

    /// The token callback failed; the stream was abandoned.
    #[error("token sink failed: {0}")]
    Sink(#[from] StoreError),
}

/// Per-token callback handed to [`ModelProvider::stream`].
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn on_token(&self, text: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream(
        &self,
        request: &CompletionRequest,
        sink: &dyn TokenSink,
    ) -> Result<Completion, ProviderError>;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}
