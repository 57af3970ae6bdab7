//! AgentWorks Gateway - LLM provider routing and normalization
//!
//! This crate is the platform's single door to LLM vendors:
//! - Adapters: OpenAI, Anthropic Claude and Google Gemini, each
//!   normalizing one vendor's request/response/streaming shape into
//!   the internal message/tool/stream contract
//! - Router: provider selection, failure-streak short-circuiting,
//!   dispatch, response pricing and fire-and-forget usage recording
//! - BYOA: tenant-supplied credentials resolved from the internal API
//!   and executed through one-shot adapters at zero platform cost
//! - Pricing: static per-model cost table with a fixed platform markup
//! - Streaming: tagged token streams with exactly-once termination
//!
//! Usage accounting, provider health and rate limiting live in the
//! companion `agentworks-metering` crate (re-exported as `metering`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anthropic;
pub mod byoa;
pub mod completion;
pub mod error;
pub mod gemini;
pub mod message;
pub mod openai;
pub mod pricing;
pub mod provider;
pub mod registry;
pub mod router;
pub mod stream;
pub mod token;
pub mod tools;
pub mod util;

pub use byoa::{ByoaBinding, ByoaClient, ByoaConfig, ByoaCredential};
pub use completion::{CompletionRequest, CompletionResponse, TokenUsage};
pub use error::{Error, Result};
pub use message::{Message, MessageRole};
pub use pricing::{CostEstimate, ModelPricing, PricingTable};
pub use provider::ChatProvider;
pub use registry::{build_adapter, default_adapter_factory, AdapterFactory, ProviderRegistry};
pub use router::{MockProvider, ProviderRouter, RouteRequest, RouteResult};
pub use stream::{StreamToken, TokenStream};
pub use tools::{ToolCall, ToolChoice, ToolDefinition};

// Re-export provider types
pub use anthropic::{AnthropicConfig, AnthropicProvider};
pub use gemini::{GeminiConfig, GeminiProvider};
pub use openai::{OpenAiConfig, OpenAiProvider};

// Re-export the metering crate for callers that wire up tracking
pub use agentworks_metering as metering;
