//! Model providers by model id.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ports::ModelProvider;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider for model '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Maps each routable model id to the client that serves it.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ModelProvider + 'static>(
        &mut self,
        model_id: impl Into<String>,
        provider: P,
    ) -> Result<(), RegistryError> {
        self.register_shared(model_id, Arc::new(provider))
    }

    /// Register a provider that serves several model ids.
    pub fn register_shared(
        &mut self,
        model_id: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<(), RegistryError> {
        let model_id = model_id.into();
        if self.providers.contains_key(&model_id) {
            return Err(RegistryError::AlreadyRegistered(model_id));
        }
        self.providers.insert(model_id, provider);
        Ok(())
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(model_id).cloned()
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Which of `wanted` have no provider.
    pub fn missing<'a>(&self, wanted: &'a [String]) -> Vec<&'a str> {
        wanted
            .iter()
            .filter(|id| !self.providers.contains_key(id.as_str()))
            .map(String::as_str)
            .collect()
    }
}
