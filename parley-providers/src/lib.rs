//! Text-generation providers for parley
//!
//! The server only sees [`LLMProvider`]; this crate supplies an
//! OpenAI-compatible HTTP client, an adapter for blocking functions and an
//! offline echo backend.

pub mod base;
pub mod blocking;
pub mod chat_completions;
pub mod echo;

pub use base::{LLMProvider, LLMResponse, Message, ProviderError, ProviderResult};
pub use blocking::{BlockingFnProvider, GenerateFn};
pub use chat_completions::ChatCompletionsClient;
pub use echo::EchoProvider;
