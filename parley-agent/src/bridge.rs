//! Generation bridge: runs provider calls off the connection loop.
//!
//! Every call is spawned on its own task and competes for one of a fixed
//! number of worker permits. The caller gets a [`PendingReply`] it can
//! await, cancel, or simply drop (which cancels as well).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_core::config::Config;
use parley_core::session::ChatMessage;
use parley_providers::{LLMProvider, ProviderError};

use crate::context::ContextBuilder;

/// Why a generation produced no reply
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider returned an empty reply")]
    EmptyReply,

    #[error("generation cancelled")]
    Cancelled,

    #[error("generation task aborted: {0}")]
    Aborted(String),

    #[error("worker pool closed")]
    Closed,
}

impl GenerationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationError::Cancelled)
    }
}

/// Per-call provider parameters
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 512,
            temperature: 0.7,
            timeout: Duration::from_secs(60),
        }
    }
}

/// What the bridge needs to know about one call
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub session_id: String,
    pub history: Vec<ChatMessage>,
    pub text: String,
    pub visitor_name: Option<String>,
}

/// Bounded, cancellable access to a provider
pub struct GenerationBridge {
    provider: Arc<dyn LLMProvider>,
    context: Arc<ContextBuilder>,
    permits: Arc<Semaphore>,
    settings: BridgeSettings,
}

impl GenerationBridge {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        context: ContextBuilder,
        workers: usize,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            provider,
            context: Arc::new(context),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            settings,
        }
    }

    pub fn from_config(provider: Arc<dyn LLMProvider>, config: &Config) -> Self {
        let context = ContextBuilder::new(
            config.provider.system_prompt.clone(),
            config.session.history_turns,
        );
        let settings = BridgeSettings {
            model: Some(config.provider.model.clone()),
            max_tokens: config.provider.max_tokens,
            temperature: config.provider.temperature,
            timeout: Duration::from_secs(config.provider.timeout_secs),
        };
        Self::new(provider, context, config.provider.workers, settings)
    }

    pub fn context(&self) -> &ContextBuilder {
        &self.context
    }

    /// Worker permits not currently in use
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Start a generation and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, request: GenerationRequest) -> PendingReply {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let provider = Arc::clone(&self.provider);
        let context = Arc::clone(&self.context);
        let permits = Arc::clone(&self.permits);
        let settings = self.settings.clone();

        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = task_token.cancelled() => return Err(GenerationError::Cancelled),
                permit = permits.acquire_owned() => permit.map_err(|_| GenerationError::Closed)?,
            };

            let messages = context.build_messages(
                &request.history,
                &request.text,
                request.visitor_name.as_deref(),
            );
            debug!(
                session = %request.session_id,
                messages = messages.len(),
                "Dispatching generation"
            );

            let call = provider.chat(
                messages,
                settings.model.clone(),
                settings.max_tokens,
                settings.temperature,
            );
            let response = tokio::select! {
                biased;
                _ = task_token.cancelled() => return Err(GenerationError::Cancelled),
                result = tokio::time::timeout(settings.timeout, call) => {
                    result.map_err(|_| GenerationError::Timeout(settings.timeout))??
                }
            };

            response
                .non_empty_content()
                .map(str::to_string)
                .ok_or(GenerationError::EmptyReply)
        });

        PendingReply { handle, token }
    }
}

/// Handle to an in-flight generation.
///
/// Resolves to the reply text. Dropping the handle cancels the call.
#[derive(Debug)]
pub struct PendingReply {
    handle: JoinHandle<Result<String, GenerationError>>,
    token: CancellationToken,
}

impl PendingReply {
    /// Ask the call to stop. The handle then resolves to
    /// [`GenerationError::Cancelled`] unless the reply was already complete.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Future for PendingReply {
    type Output = Result<String, GenerationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_err)) if join_err.is_cancelled() => {
                Poll::Ready(Err(GenerationError::Cancelled))
            }
            Poll::Ready(Err(join_err)) => {
                warn!("Generation task failed: {}", join_err);
                Poll::Ready(Err(GenerationError::Aborted(join_err.to_string())))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
