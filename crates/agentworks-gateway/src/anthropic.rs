//! Anthropic - Claude Messages API provider
//!
//! This module implements the Anthropic Claude provider using reqwest.
//!
//! Two normalization rules are vendor-mandated here: system messages
//! are hoisted out of the conversation into the top-level `system`
//! field, and consecutive tool-result messages are grouped into one
//! synthetic user turn; the Messages API rejects a conversation that
//! answers two tool calls with two separate user turns.

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
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Anthropic API version
const API_VERSION: &str = "2023-06-01";

/// Available Anthropic models (2026)
///
/// Claude 4.5 family pricing (per 1M tokens):
/// - claude-haiku-4-5: $1.00/$5.00 (fastest, cheapest 4.5)
/// - claude-sonnet-4-5: $3.00/$15.00 (balanced)
/// - claude-opus-4-5: $5.00/$25.00 (most capable)
pub const MODELS: &[&str] = &[
    // Claude 4.5 family (latest)
    "claude-opus-4-5-20250514",
    "claude-sonnet-4-5-20250929",
    "claude-haiku-4-5-20251001",
    // Claude 3.5 family (legacy)
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
];

/// Default — Claude Sonnet 4.5
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Default API base URL
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic provider configuration
#[derive(Clone)]
pub struct AnthropicConfig {
    /// API key
    pub api_key: String,
    /// Base URL
    pub base_url: String,
    /// Default model
    pub default_model: String,
    /// Default max tokens
    pub default_max_tokens: u32,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug implementation to mask the API key
impl fmt::Debug for AnthropicConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnthropicConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AnthropicConfig {
    /// Create a new configuration with an API key
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            default_max_tokens: 4096,
            timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| Error::NotConfigured("ANTHROPIC_API_KEY not set".to_string()))?;

        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let default_model =
            std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self {
            api_key,
            base_url,
            default_model,
            default_max_tokens: 4096,
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

    /// Set the default max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.default_max_tokens = max_tokens;
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

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "tool")]
    Tool { name: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    r#type: String,
    message: String,
}

/// Raw SSE event from the streaming Messages API
#[derive(Debug, Deserialize)]
struct RawStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    message: Option<serde_json::Value>,
    #[serde(default)]
    content_block: Option<serde_json::Value>,
    #[serde(default)]
    delta: Option<serde_json::Value>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Accumulates one tool_use block's argument fragments
struct ToolUseBuffer {
    id: String,
    name: String,
    partial_json: String,
}

impl ToolUseBuffer {
    /// Parse the buffered arguments at the block's closing boundary
    ///
    /// A malformed or incomplete buffer yields an empty-arguments call
    /// rather than failing the stream.
    fn finish(self) -> ToolCall {
        let arguments = if self.partial_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.partial_json).unwrap_or_else(|e| {
                warn!(error = %e, "malformed tool_use input buffer, substituting empty object");
                json!({})
            })
        };
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Anthropic Claude provider
pub struct AnthropicProvider {
    client: RwLock<Client>,
    config: AnthropicConfig,
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

impl AnthropicProvider {
    /// Create a new Anthropic provider
    #[must_use]
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            client: RwLock::new(build_client(config.timeout)),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(AnthropicConfig::from_env()?))
    }

    fn http(&self) -> Client {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Convert messages to Anthropic format, hoisting system messages
    ///
    /// Consecutive tool results are appended to the previous synthetic
    /// user turn so that multiple results for one assistant turn arrive
    /// as a single message.
    fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system_parts = Vec::new();
        let mut anthropic_messages: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            match msg.role {
                MessageRole::System => {
                    if !msg.content.is_empty() {
                        system_parts.push(msg.content.clone());
                    }
                }
                MessageRole::User => {
                    anthropic_messages.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: AnthropicContent::Text(msg.content.clone()),
                    });
                }
                MessageRole::Assistant => {
                    let content = match &msg.tool_calls {
                        Some(calls) if !calls.is_empty() => {
                            let mut blocks = Vec::new();
                            if !msg.content.is_empty() {
                                blocks.push(ContentBlock::Text {
                                    text: msg.content.clone(),
                                });
                            }
                            for call in calls {
                                blocks.push(ContentBlock::ToolUse {
                                    id: call.id.clone(),
                                    name: call.name.clone(),
                                    input: call.arguments.clone(),
                                });
                            }
                            AnthropicContent::Blocks(blocks)
                        }
                        _ => AnthropicContent::Text(msg.content.clone()),
                    };
                    anthropic_messages.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content,
                    });
                }
                MessageRole::Tool => {
                    let Some(tool_call_id) = &msg.tool_call_id else {
                        continue;
                    };
                    let mut pending = Some(ContentBlock::ToolResult {
                        tool_use_id: tool_call_id.clone(),
                        content: msg.content.clone(),
                        is_error: None,
                    });

                    // Real user turns carry Text content, so only the
                    // synthetic tool-result turns match here
                    if let Some(AnthropicMessage {
                        role,
                        content: AnthropicContent::Blocks(blocks),
                    }) = anthropic_messages.last_mut()
                    {
                        if role.as_str() == "user" {
                            if let Some(block) = pending.take() {
                                blocks.push(block);
                            }
                        }
                    }

                    if let Some(block) = pending {
                        anthropic_messages.push(AnthropicMessage {
                            role: "user".to_string(),
                            content: AnthropicContent::Blocks(vec![block]),
                        });
                    }
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        (system, anthropic_messages)
    }

    fn convert_tool(tool: &ToolDefinition) -> AnthropicTool {
        AnthropicTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.parameters.clone(),
        }
    }

    fn convert_tool_choice(choice: &ToolChoice) -> Option<AnthropicToolChoice> {
        match choice {
            ToolChoice::Auto => Some(AnthropicToolChoice::Auto),
            // Anthropic has no "none" option; tools are simply not sent
            ToolChoice::None => None,
            ToolChoice::Required => Some(AnthropicToolChoice::Any),
            ToolChoice::Tool(name) => Some(AnthropicToolChoice::Tool { name: name.clone() }),
        }
    }

    fn build_request(&self, request: &CompletionRequest, streaming: bool) -> AnthropicRequest {
        let model = if request.model.is_empty() {
            &self.config.default_model
        } else {
            &request.model
        };

        let (system, messages) = Self::convert_messages(&request.messages);

        let (tools, tool_choice) = if request.tools.is_empty()
            || matches!(request.tool_choice, ToolChoice::None)
        {
            (None, None)
        } else {
            (
                Some(request.tools.iter().map(Self::convert_tool).collect()),
                Self::convert_tool_choice(&request.tool_choice),
            )
        };

        AnthropicRequest {
            model: model.to_string(),
            max_tokens: request.max_tokens.unwrap_or(self.config.default_max_tokens),
            system,
            messages,
            temperature: request.temperature,
            stop_sequences: request.stop.clone(),
            tools,
            tool_choice,
            stream: streaming,
        }
    }

    fn map_error_body(status: reqwest::StatusCode, body: &str) -> Error {
        if let Ok(error) = serde_json::from_str::<AnthropicError>(body) {
            if status.as_u16() == 429 {
                return Error::RateLimit;
            }
            return Error::Api(sanitize_api_error(&format!(
                "{}: {}",
                error.error.r#type, error.error.message
            )));
        }
        Error::Api(sanitize_api_error(&format!("HTTP {}: {}", status, body)))
    }

    async fn dispatch(&self, request: &AnthropicRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.base_url);

        debug!("Sending request to Anthropic: {}", request.model);

        let response = self
            .http()
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(self.config.timeout.as_millis() as u64)
                } else {
                    Error::Network(e.to_string())
                }
            })?;

        Ok(response)
    }

    async fn send_request(&self, request: AnthropicRequest) -> Result<AnthropicResponse> {
        let response = self.dispatch(&request).await?;

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
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
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
        let anthropic_request = self.build_request(&request, false);
        let response = self.send_request(anthropic_request).await?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in response.content {
            match block {
                ResponseContentBlock::Text { text } => content.push_str(&text),
                ResponseContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input,
                    });
                }
            }
        }

        let usage = TokenUsage::exact(response.usage.input_tokens, response.usage.output_tokens);

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage,
            finish_reason: response.stop_reason,
            model: response.model,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn stream_chat(&self, request: CompletionRequest) -> TokenStream {
        let input_estimate = count_conversation_tokens(&request.messages);
        let anthropic_request = self.build_request(&request, true);

        let response = match self.dispatch(&anthropic_request).await {
            Ok(response) => response,
            Err(e) => return error_stream(e.to_string()),
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

/// Decode an Anthropic SSE byte stream into `StreamToken`s
///
/// Tool-use argument fragments (`input_json_delta`) are buffered until
/// the block's `content_block_stop` boundary. Exactly one `Done` or
/// `Error` ends the stream.
pub(crate) fn decode_stream<S>(source: S, input_estimate: u32) -> TokenStream
where
    S: futures::Stream<Item = std::result::Result<Vec<u8>, String>> + Send + 'static,
{
    Box::pin(stream! {
        futures::pin_mut!(source);

        let mut lines = SseLineBuffer::new();
        let mut open_tool: Option<ToolUseBuffer> = None;
        let mut input_tokens: Option<u32> = None;
        let mut output_tokens: Option<u32> = None;
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

                let event: RawStreamEvent = match serde_json::from_str(data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "skipping malformed stream event");
                        continue;
                    }
                };

                match event.event_type.as_str() {
                    "message_start" => {
                        input_tokens = event
                            .message
                            .as_ref()
                            .and_then(|m| m.pointer("/usage/input_tokens"))
                            .and_then(serde_json::Value::as_u64)
                            .map(|n| n as u32);
                    }
                    "content_block_start" => {
                        let block = event.content_block.as_ref();
                        let block_type = block
                            .and_then(|b| b.get("type"))
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("text");
                        if block_type == "tool_use" {
                            open_tool = Some(ToolUseBuffer {
                                id: block
                                    .and_then(|b| b.get("id"))
                                    .and_then(serde_json::Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                name: block
                                    .and_then(|b| b.get("name"))
                                    .and_then(serde_json::Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                partial_json: String::new(),
                            });
                        }
                    }
                    "content_block_delta" => {
                        let delta = event.delta.as_ref();
                        if let Some(text) = delta
                            .and_then(|d| d.get("text"))
                            .and_then(serde_json::Value::as_str)
                        {
                            if !text.is_empty() {
                                output_text.push_str(text);
                                yield StreamToken::Token {
                                    content: text.to_string(),
                                };
                            }
                        }
                        if let Some(fragment) = delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(serde_json::Value::as_str)
                        {
                            if let Some(buffer) = open_tool.as_mut() {
                                buffer.partial_json.push_str(fragment);
                            }
                        }
                    }
                    "content_block_stop" => {
                        if let Some(buffer) = open_tool.take() {
                            yield StreamToken::ToolCall {
                                tool_call: buffer.finish(),
                            };
                        }
                    }
                    "message_delta" => {
                        if let Some(tokens) = event
                            .usage
                            .as_ref()
                            .and_then(|u| u.get("output_tokens"))
                            .and_then(serde_json::Value::as_u64)
                        {
                            output_tokens = Some(tokens as u32);
                        }
                    }
                    "message_stop" => {
                        let usage = match (input_tokens, output_tokens) {
                            (Some(input), Some(output)) => TokenUsage::exact(input, output),
                            (input, output) => TokenUsage::estimate(
                                input.unwrap_or(input_estimate),
                                output.unwrap_or_else(|| count_tokens(&output_text)),
                            ),
                        };
                        yield StreamToken::Done { usage };
                        return;
                    }
                    "error" => {
                        let message = event
                            .error
                            .as_ref()
                            .and_then(|e| e.get("message"))
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("unknown vendor error");
                        yield StreamToken::Error {
                            message: sanitize_api_error(message),
                        };
                        return;
                    }
                    // ping and future event types are keep-alive noise
                    _ => {}
                }
            }
        }

        // Transport closed without message_stop
        yield StreamToken::Error {
            message: "stream ended before completion".to_string(),
        };
    })
}
