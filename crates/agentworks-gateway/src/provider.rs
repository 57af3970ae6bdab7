//! Provider adapter trait
//!
//! One implementation per vendor. Adapters translate the internal
//! message/tool/stream contract to and from one provider's API and own
//! that vendor's HTTP client lifecycle.

use crate::completion::{CompletionRequest, CompletionResponse};
use crate::error::Result;
use crate::stream::TokenStream;

/// Trait for LLM provider adapters
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Check if the provider supports function calling/tools
    fn supports_tools(&self) -> bool;

    /// Get available models
    fn available_models(&self) -> Vec<String>;

    /// Get the default model
    fn default_model(&self) -> &str;

    /// Discard the vendor HTTP client and lazily rebuild it
    ///
    /// Called when credentials rotate so no connection keeps using the
    /// old identity.
    fn reset_client(&self);

    /// Complete a conversation
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Stream a conversation completion
    ///
    /// Failures do not return `Err`: any error, including one raised
    /// before the vendor stream opens, terminates the stream with a
    /// single `StreamToken::Error` so consumers always see a
    /// well-formed termination.
    async fn stream_chat(&self, request: CompletionRequest) -> TokenStream;
}
