//! # clawlite-llm
//!
//! Uniform chat-completion interface over several LLM vendors with
//! streaming, plus the router that applies retries, per-provider circuit
//! breaking, the ordered fallback chain and the offline fallback.

pub mod anthropic;
pub mod local;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod router;

pub use mock::MockProvider;
pub use provider::{ChatProvider, ChatRequest, ChatResponse, StopReason, StreamChunk, Usage};
pub use router::{ProviderRouter, RouteMode, RouteOutcome, StreamOutcome};
