//! OpenAI - Chat Completions provider
//!
//! This module implements the OpenAI provider using reqwest against the
//! Chat Completions API, including SSE streaming. Tool-call arguments
//! arrive as string fragments spread across stream chunks; they are
//! buffered per tool-call index and parsed only when the stream closes.

use crate::completion::{CompletionRequest, CompletionResponse, TokenUsage};
use crate::error::{Error, Result};
use crate::message::{Message, MessageRole};
use crate::provider::ChatProvider;
use crate::stream::{error_stream, sse_data, SseLineBuffer, StreamToken, TokenStream};
use crate::token::{count_conversation_tokens, count_tokens};
use crate::tools::{ToolCall, ToolChoice, ToolDefinition};
use crate::util::{mask_api_key, sanitize_api_error};
use async_stream::stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// OpenAI API base URL
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Available OpenAI models (2026)
///
/// GPT-5 family pricing (per 1M tokens):
/// - gpt-5-nano: $0.05/$0.40 (cheapest, 32K context)
/// - gpt-5: $1.25/$10.00 (400K context)
///
/// GPT-4o family (legacy, still available):
/// - gpt-4o-mini: $0.15/$0.60 (128K context)
/// - gpt-4o: $2.50/$10.00 (128K context)
pub const MODELS: &[&str] = &[
    // GPT-5 family (2025-08~)
    "gpt-5",
    "gpt-5-nano",
    // GPT-4o family (legacy)
    "gpt-4o",
    "gpt-4o-mini",
];

/// Default model
pub const DEFAULT_MODEL: &str = "gpt-5";

/// OpenAI provider configuration
#[derive(Clone)]
pub struct OpenAiConfig {
    /// API key
    pub api_key: String,
    /// Base URL (Azure OpenAI or proxies)
    pub base_url: String,
    /// Default model
    pub default_model: String,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug implementation to mask the API key
impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OpenAiConfig {
    /// Create a new configuration with an API key
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: OPENAI_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::NotConfigured("OPENAI_API_KEY not set".to_string()))?;

        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| OPENAI_API_BASE.to_string());
        let default_model =
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self {
            api_key,
            base_url,
            default_model,
            timeout: Duration::from_secs(60),
        })
    }

    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the default model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    /// Arguments as a JSON-encoded string, per the vendor wire format
    arguments: String,
}

#[derive(Serialize)]
struct ApiTool {
    r#type: String,
    function: ApiFunction,
}

#[derive(Serialize)]
struct ApiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
    model: String,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// Streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates one tool call's fragments across stream chunks
#[derive(Default)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallBuffer {
    /// Parse the accumulated argument buffer at the closing boundary
    ///
    /// A malformed or incomplete buffer yields an empty-arguments call
    /// rather than failing the stream.
    fn finish(self) -> ToolCall {
        let arguments = parse_arguments(&self.arguments);
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, "malformed tool-call arguments, substituting empty object");
        json!({})
    })
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// OpenAI provider
pub struct OpenAiProvider {
    client: RwLock<Client>,
    config: OpenAiConfig,
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

impl OpenAiProvider {
    /// Create a new OpenAI provider
    #[must_use]
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: RwLock::new(build_client(config.timeout)),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(OpenAiConfig::from_env()?))
    }

    fn http(&self) -> Client {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn resolve_model<'a>(&'a self, request: &'a CompletionRequest) -> &'a str {
        if request.model.is_empty() {
            &self.config.default_model
        } else {
            &request.model
        }
    }

    fn convert_message(msg: &Message) -> ApiMessage {
        let tool_calls = msg.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|tc| ApiToolCall {
                    id: tc.id.clone(),
                    r#type: "function".to_string(),
                    function: ApiFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect()
        });

        ApiMessage {
            role: msg.role.as_str().to_string(),
            content: match (msg.role, msg.content.is_empty()) {
                // Assistant tool-call turns may carry no text
                (MessageRole::Assistant, true) if tool_calls.is_some() => None,
                _ => Some(msg.content.clone()),
            },
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }

    fn convert_tool(tool: &ToolDefinition) -> ApiTool {
        ApiTool {
            r#type: "function".to_string(),
            function: ApiFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        }
    }

    fn convert_tool_choice(choice: &ToolChoice) -> serde_json::Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Tool(name) => json!({
                "type": "function",
                "function": { "name": name }
            }),
        }
    }

    fn build_request(&self, request: &CompletionRequest, streaming: bool) -> ApiRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(Self::convert_tool).collect())
        };
        let tool_choice = tools
            .as_ref()
            .map(|_| Self::convert_tool_choice(&request.tool_choice));

        ApiRequest {
            model: self.resolve_model(request).to_string(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop.clone(),
            tools,
            tool_choice,
            stream: streaming,
            stream_options: streaming.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn map_error_body(status: reqwest::StatusCode, body: &str) -> Error {
        if let Ok(error) = serde_json::from_str::<ApiError>(body) {
            if status.as_u16() == 429 {
                return Error::RateLimit;
            }
            return Error::Api(sanitize_api_error(&error.error.message));
        }
        Error::Api(sanitize_api_error(&format!("HTTP {}: {}", status, body)))
    }

    async fn send_request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = format!("{}/chat/completions", self.config.base_url);

        debug!("Sending request to OpenAI: {}", request.model);

        let response = self
            .http()
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(self.config.timeout.as_millis() as u64)
                } else {
                    Error::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::map_error_body(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| Error::InvalidResponse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_tools(&self) -> bool {
        true
    }

    fn available_models(&self) -> Vec<String> {
        MODELS.iter().map(|s| (*s).to_string()).collect()
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    fn reset_client(&self) {
        let mut client = self.client.write().unwrap_or_else(|e| e.into_inner());
        *client = build_client(self.config.timeout);
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let api_request = self.build_request(&request, false);
        let response = self.send_request(api_request).await?;

        let model = response.model;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidResponse("No choices in response".to_string()))?;

        let content = choice.message.content.unwrap_or_default();

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .map(|calls| {
                calls
                    .into_iter()
                    .map(|tc| ToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments: parse_arguments(&tc.function.arguments),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = match response.usage {
            Some(u) => TokenUsage::exact(u.prompt_tokens, u.completion_tokens),
            // Vendor failed to report usage; estimate rather than bill as free
            None => TokenUsage::estimate(
                count_conversation_tokens(&request.messages),
                count_tokens(&content),
            ),
        };

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage,
            finish_reason: choice.finish_reason,
            model,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn stream_chat(&self, request: CompletionRequest) -> TokenStream {
        let input_estimate = count_conversation_tokens(&request.messages);
        let api_request = self.build_request(&request, true);
        let url = format!("{}/chat/completions", self.config.base_url);

        let response = match self
            .http()
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&api_request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return error_stream(sanitize_api_error(&e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return error_stream(Self::map_error_body(status, &body).to_string());
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()));
        decode_stream(bytes, input_estimate)
    }
}

/// Decode an OpenAI SSE byte stream into `StreamToken`s
///
/// Tool-call argument fragments are buffered per index and flushed, in
/// index order, at the `[DONE]` boundary just before the terminal
/// `Done` token. Exactly one `Done` or `Error` ends the stream.
pub(crate) fn decode_stream<S>(source: S, input_estimate: u32) -> TokenStream
where
    S: futures::Stream<Item = std::result::Result<Vec<u8>, String>> + Send + 'static,
{
    Box::pin(stream! {
        futures::pin_mut!(source);

        let mut lines = SseLineBuffer::new();
        let mut tool_buffers: BTreeMap<u32, ToolCallBuffer> = BTreeMap::new();
        let mut usage: Option<ApiUsage> = None;
        let mut output_text = String::new();

        while let Some(chunk) = source.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield StreamToken::Error {
                        message: sanitize_api_error(&e),
                    };
                    return;
                }
            };

            for line in lines.push(&chunk) {
                let Some(data) = sse_data(&line) else { continue };

                if data == "[DONE]" {
                    for (_, buffer) in std::mem::take(&mut tool_buffers) {
                        yield StreamToken::ToolCall {
                            tool_call: buffer.finish(),
                        };
                    }
                    let usage = match usage {
                        Some(u) => TokenUsage::exact(u.prompt_tokens, u.completion_tokens),
                        None => TokenUsage::estimate(input_estimate, count_tokens(&output_text)),
                    };
                    yield StreamToken::Done { usage };
                    return;
                }

                let parsed: StreamChunk = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(error = %e, "skipping malformed stream chunk");
                        continue;
                    }
                };

                if let Some(u) = parsed.usage {
                    usage = Some(u);
                }

                for choice in parsed.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            output_text.push_str(&content);
                            yield StreamToken::Token { content };
                        }
                    }
                    for delta in choice.delta.tool_calls.unwrap_or_default() {
                        let buffer = tool_buffers.entry(delta.index).or_default();
                        if let Some(id) = delta.id {
                            buffer.id = id;
                        }
                        if let Some(function) = delta.function {
                            if let Some(name) = function.name {
                                buffer.name.push_str(&name);
                            }
                            if let Some(arguments) = function.arguments {
                                buffer.arguments.push_str(&arguments);
                            }
                        }
                    }
                }
            }
        }

        // Transport closed without the [DONE] sentinel
        yield StreamToken::Error {
            message: "stream ended before completion".to_string(),
        };
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn ok(data: &str) -> std::result::Result<Vec<u8>, String> {
        Ok(format!("data: {data}\n\n").into_bytes())
    }

    async fn collect(tokens: TokenStream) -> Vec<StreamToken> {
        tokens.collect().await
    }

    #[test]
    fn test_config_builder() {
        let config = OpenAiConfig::new("test-key")
            .with_model("gpt-4o-mini")
            .with_timeout(Duration::from_secs(30));

        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.default_model, "gpt-4o-mini");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_debug_masks_key() {
        let config = OpenAiConfig::new("sk-1234567890abcdefghij");
        let debug_str = format!("{:?}", config);

        assert!(!debug_str.contains("1234567890"));
        assert!(debug_str.contains("sk-1...ghij"));
    }

    #[test]
    fn test_convert_tool_message() {
        let msg = Message::tool_result("call_1", "42");
        let converted = OpenAiProvider::convert_message(&msg);

        assert_eq!(converted.role, "tool");
        assert_eq!(converted.tool_call_id, Some("call_1".to_string()));
        assert_eq!(converted.content, Some("42".to_string()));
    }

    #[test]
    fn test_convert_assistant_with_tool_calls() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "search".to_string(),
                arguments: json!({"query": "rust"}),
            }],
        );
        let converted = OpenAiProvider::convert_message(&msg);

        assert_eq!(converted.role, "assistant");
        assert!(converted.content.is_none());
        let calls = converted.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "search");
        assert!(calls[0].function.arguments.contains("rust"));
    }

    #[tokio::test]
    async fn test_stream_text_then_done() {
        let chunks = vec![
            ok(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#),
            ok(r#"{"choices":[{"delta":{"content":"lo"}}]}"#),
            ok(r#"{"choices":[{"delta":{}}],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#),
            ok("[DONE]"),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        assert_eq!(
            tokens,
            vec![
                StreamToken::Token { content: "Hel".to_string() },
                StreamToken::Token { content: "lo".to_string() },
                StreamToken::Done { usage: TokenUsage::exact(10, 5) },
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_buffers_tool_arguments_across_chunks() {
        let chunks = vec![
            ok(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search","arguments":""}}]}}]}"#),
            ok(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"que"}}]}}]}"#),
            ok(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ry\":\"rust\"}"}}]}}]}"#),
            ok(r#"{"choices":[{"delta":{}}],"usage":{"prompt_tokens":20,"completion_tokens":8}}"#),
            ok("[DONE]"),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        assert_eq!(tokens.len(), 2);
        match &tokens[0] {
            StreamToken::ToolCall { tool_call } => {
                assert_eq!(tool_call.id, "call_1");
                assert_eq!(tool_call.name, "search");
                assert_eq!(tool_call.arguments, json!({"query": "rust"}));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert!(matches!(tokens[1], StreamToken::Done { .. }));
    }

    #[tokio::test]
    async fn test_stream_malformed_tool_arguments_yield_empty_object() {
        let chunks = vec![
            ok(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search","arguments":"{\"broken"}}]}}]}"#),
            ok("[DONE]"),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        match &tokens[0] {
            StreamToken::ToolCall { tool_call } => {
                assert_eq!(tool_call.arguments, json!({}));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_transport_error_terminates_with_error() {
        let chunks = vec![
            ok(r#"{"choices":[{"delta":{"content":"partial"}}]}"#),
            Err("connection reset".to_string()),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[0], StreamToken::Token { .. }));
        assert!(matches!(tokens[1], StreamToken::Error { .. }));
    }

    #[tokio::test]
    async fn test_stream_truncated_transport_is_an_error() {
        let chunks = vec![ok(r#"{"choices":[{"delta":{"content":"hi"}}]}"#)];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        assert!(matches!(tokens.last(), Some(StreamToken::Error { .. })));
    }

    #[tokio::test]
    async fn test_stream_missing_usage_is_estimated() {
        let chunks = vec![
            ok(r#"{"choices":[{"delta":{"content":"Hello world"}}]}"#),
            ok("[DONE]"),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 42)).await;

        match tokens.last().unwrap() {
            StreamToken::Done { usage } => {
                assert!(usage.estimated);
                assert_eq!(usage.input_tokens, 42);
                assert!(usage.output_tokens > 0);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_events_split_across_transport_chunks() {
        let whole = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        let chunks = vec![
            Ok(whole.as_bytes()[..20].to_vec()),
            Ok([&whole.as_bytes()[20..], b"\n\ndata: [DONE]\n\n"].concat()),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        assert_eq!(tokens.len(), 2);
        assert_eq!(
            tokens[0],
            StreamToken::Token { content: "Hello".to_string() }
        );
    }
}
