//! Scriptable provider for router tests

use crate::completion::{CompletionRequest, CompletionResponse, TokenUsage};
use crate::error::Result;
use crate::provider::ChatProvider;
use crate::stream::{StreamToken, TokenStream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A mock provider that returns queued responses, errors or stream
/// scripts, falling back to a fixed default response.
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<CompletionResponse>>>>,
    streams: Arc<Mutex<VecDeque<Vec<StreamToken>>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create a new mock provider
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            streams: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue a completion response
    pub fn add_response(&self, response: CompletionResponse) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(response));
    }

    /// Queue a completion failure
    pub fn add_error(&self, error: crate::error::Error) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
    }

    /// Queue a stream script
    pub fn add_stream(&self, tokens: Vec<StreamToken>) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(tokens);
    }

    fn default_response() -> CompletionResponse {
        CompletionResponse {
            content: "mock response".to_string(),
            tool_calls: vec![],
            usage: TokenUsage::exact(1, 1),
            finish_reason: Some("stop".to_string()),
            model: "mock-model".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_tools(&self) -> bool {
        true
    }

    fn available_models(&self) -> Vec<String> {
        vec!["mock-model".to_string()]
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    fn reset_client(&self) {}

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
        let queued = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match queued {
            Some(result) => result,
            None => Ok(Self::default_response()),
        }
    }

    async fn stream_chat(&self, _request: CompletionRequest) -> TokenStream {
        let queued = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let tokens = queued.unwrap_or_else(|| {
            vec![
                StreamToken::Token {
                    content: "mock response".to_string(),
                },
                StreamToken::Done {
                    usage: TokenUsage::exact(1, 1),
                },
            ]
        });
        Box::pin(futures::stream::iter(tokens))
    }
}
