//! Adapter for synchronous generation functions

use async_trait::async_trait;
use std::sync::Arc;

use crate::base::{LLMProvider, LLMResponse, Message, ProviderError, ProviderResult};

/// Signature of a synchronous generation function.
///
/// Receives the prompt messages and returns the reply text or an error
/// description.
pub type GenerateFn = dyn Fn(&[Message]) -> Result<String, String> + Send + Sync;

/// Runs a blocking function on tokio's blocking pool so it never stalls
/// the async workers
pub struct BlockingFnProvider {
    name: String,
    generate: Arc<GenerateFn>,
}

impl BlockingFnProvider {
    pub fn new<F>(name: impl Into<String>, generate: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            generate: Arc::new(generate),
        }
    }
}

#[async_trait]
impl LLMProvider for BlockingFnProvider {
    async fn chat(
        &self,
        messages: Vec<Message>,
        _model: Option<String>,
        _max_tokens: u32,
        _temperature: f32,
    ) -> ProviderResult<LLMResponse> {
        let generate = Arc::clone(&self.generate);
        let result = tokio::task::spawn_blocking(move || generate(&messages))
            .await
            .map_err(|e| ProviderError::TaskFailed(e.to_string()))?;

        result.map(LLMResponse::text).map_err(ProviderError::ApiError)
    }

    fn get_default_model(&self) -> String {
        self.name.clone()
    }
}
