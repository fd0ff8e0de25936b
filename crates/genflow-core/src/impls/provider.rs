//! Scripted model provider for tests and local runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Usage;
use crate::ports::{Completion, CompletionRequest, ModelProvider, ProviderError, TokenSink};

#[derive(Debug, Clone)]
enum Script {
    Tokens(Vec<String>),
    Fail(String),
}

/// Replays a fixed output, optionally paced with delays.
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    script: Script,
    initial_delay: Duration,
    token_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::Tokens(tokens.into_iter().map(Into::into).collect()))
    }

    /// Whole response as one fragment.
    pub fn text(text: impl Into<String>) -> Self {
        Self::with_script(Script::Tokens(vec![text.into()]))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_script(Script::Fail(message.into()))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            initial_delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tokens_or_fail(&self) -> Result<&[String], ProviderError> {
        match &self.script {
            Script::Tokens(tokens) => Ok(tokens),
            Script::Fail(message) => Err(ProviderError::Upstream(message.clone())),
        }
    }
}

fn usage_for(request: &CompletionRequest, tokens: &[String]) -> Usage {
    Usage {
        input_tokens: request.variables.to_string().len() as u32 / 4,
        output_tokens: tokens.len() as u32,
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream(
        &self,
        request: &CompletionRequest,
        sink: &dyn TokenSink,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.initial_delay.is_zero() {
            tokio::time::sleep(self.initial_delay).await;
        }
        let tokens = self.tokens_or_fail()?;

        let mut text = String::new();
        for token in tokens {
            if !self.token_delay.is_zero() {
                tokio::time::sleep(self.token_delay).await;
            }
            sink.on_token(token).await?;
            text.push_str(token);
        }

        Ok(Completion {
            text,
            usage: usage_for(request, tokens),
        })
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.initial_delay.is_zero() {
            tokio::time::sleep(self.initial_delay).await;
        }
        let tokens = self.tokens_or_fail()?;
        Ok(Completion {
            text: tokens.concat(),
            usage: usage_for(request, tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Stage;
    use crate::error::StoreError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl TokenSink for Collect {
        async fn on_token(&self, text: &str) -> Result<(), StoreError> {
            self.0.lock().push(text.to_string());
            Ok(())
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model_id: "m".into(),
            stage: Stage::Vision,
            template_id: "job_summary".into(),
            locale: "en".into(),
            variables: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn stream_feeds_every_token_to_sink() {
        let provider = ScriptedProvider::tokens(["a", "b", "c"]);
        let sink = Collect::default();

        let completion = provider.stream(&request(), &sink).await.unwrap();

        assert_eq!(completion.text, "abc");
        assert_eq!(completion.usage.output_tokens, 3);
        assert_eq!(*sink.0.lock(), vec!["a", "b", "c"]);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn failing_script_errors_on_both_shapes() {
        let provider = ScriptedProvider::failing("quota");
        assert!(matches!(
            provider.complete(&request()).await,
            Err(ProviderError::Upstream(msg)) if msg == "quota"
        ));
        assert!(provider.stream(&request(), &Collect::default()).await.is_err());
    }
}
