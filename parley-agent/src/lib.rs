//! Prompt assembly and the generation bridge for parley

pub mod bridge;
pub mod context;

pub use bridge::{
    BridgeSettings, GenerationBridge, GenerationError, GenerationRequest, PendingReply,
};
pub use context::ContextBuilder;
