//! Offline provider that repeats the last user message

use async_trait::async_trait;
use std::time::Duration;

use crate::base::{LLMProvider, LLMResponse, Message, ProviderResult};

/// Replies with the latest user message. Handy for running the server
/// without a backend and for tests.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    delay: Option<Duration>,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering, to stand in for a slow backend
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl LLMProvider for EchoProvider {
    async fn chat(
        &self,
        messages: Vec<Message>,
        _model: Option<String>,
        _max_tokens: u32,
        _temperature: f32,
    ) -> ProviderResult<LLMResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(LLMResponse::text(format!("You said: {}", last_user)))
    }

    fn get_default_model(&self) -> String {
        "echo".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_repeats_last_user_message() {
        let provider = EchoProvider::new();
        let messages = vec![
            Message::system("sys"),
            Message::user("first"),
            Message::assistant("You said: first"),
            Message::user("second"),
        ];
        let response = provider.chat(messages, None, 16, 0.0).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("You said: second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_delay_uses_tokio_clock() {
        let provider = EchoProvider::with_delay(Duration::from_secs(30));
        let start = tokio::time::Instant::now();
        provider
            .chat(vec![Message::user("x")], None, 16, 0.0)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
