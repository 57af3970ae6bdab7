//! Gemini - Google Gemini API provider
//!
//! This module implements the Google Gemini provider using reqwest.
//!
//! Gemini's schema dialect differs from plain JSON Schema: type tags
//! are upper-case (`STRING`, `OBJECT`, ...) and only a subset of fields
//! is accepted, so tool parameter schemas are converted recursively.
//! Gemini also assigns no tool-call IDs; they are synthesized locally
//! and results round-trip by function name, which is the dialect's own
//! keying.

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

/// Gemini API base URL
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Available Gemini models (2026)
pub const MODELS: &[&str] = &[
    // Gemini 2.5 family
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    // Gemini 1.5 family (legacy)
    "gemini-1.5-pro",
    "gemini-1.5-flash",
];

/// Default model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Fields not supported by Gemini's OpenAPI Schema subset
///
/// Sending them causes INVALID_ARGUMENT 400 errors.
const UNSUPPORTED_SCHEMA_FIELDS: &[&str] = &["default", "additionalProperties", "$schema"];

/// Gemini provider configuration
#[derive(Clone)]
pub struct GeminiConfig {
    /// API key
    pub api_key: String,
    /// Base URL
    pub base_url: String,
    /// Default model
    pub default_model: String,
    /// Default max output tokens
    pub default_max_tokens: u32,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug implementation to mask the API key
impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GeminiConfig {
    /// Create a new configuration with an API key
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            default_max_tokens: 8192,
            timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| Error::NotConfigured("GEMINI_API_KEY not set".to_string()))?;

        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| GEMINI_API_BASE.to_string());
        let default_model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self {
            api_key,
            base_url,
            default_model,
            default_max_tokens: 8192,
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

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionCallingConfig {
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: u32,
    /// May be absent for empty/thinking-only responses
    #[serde(default)]
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    status: String,
}

// ============================================================================
// Schema Conversion
// ============================================================================

/// Convert a JSON-Schema-like tool parameter schema to Gemini's dialect
///
/// Recursively upper-cases `type` tags and descends through
/// `properties` and `items`; `required`, `description`, `enum`,
/// `format` and `nullable` pass through; unsupported fields are
/// stripped. Handles arbitrary nesting depth (realistic schemas stay
/// under ten levels).
fn convert_schema(schema: &serde_json::Value) -> serde_json::Value {
    match schema {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                if UNSUPPORTED_SCHEMA_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                match key.as_str() {
                    "type" => {
                        let converted = match value.as_str() {
                            Some(tag) => serde_json::Value::String(tag.to_ascii_uppercase()),
                            None => convert_schema(value),
                        };
                        out.insert(key.clone(), converted);
                    }
                    "properties" => {
                        let mut properties = serde_json::Map::new();
                        if let Some(object) = value.as_object() {
                            for (name, nested) in object {
                                properties.insert(name.clone(), convert_schema(nested));
                            }
                        }
                        out.insert(key.clone(), serde_json::Value::Object(properties));
                    }
                    "items" => {
                        out.insert(key.clone(), convert_schema(value));
                    }
                    _ => {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(convert_schema).collect())
        }
        other => other.clone(),
    }
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Google Gemini provider
pub struct GeminiProvider {
    client: RwLock<Client>,
    config: GeminiConfig,
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

impl GeminiProvider {
    /// Create a new Gemini provider
    #[must_use]
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: RwLock::new(build_client(config.timeout)),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(GeminiConfig::from_env()?))
    }

    fn http(&self) -> Client {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Convert messages to Gemini format, hoisting system messages
    fn convert_messages(messages: &[Message]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in messages {
            match msg.role {
                MessageRole::System => {
                    if !msg.content.is_empty() {
                        system_parts.push(GeminiPart::Text {
                            text: msg.content.clone(),
                        });
                    }
                }
                MessageRole::User => {
                    contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![GeminiPart::Text {
                            text: msg.content.clone(),
                        }],
                    });
                }
                MessageRole::Assistant => {
                    let mut parts = Vec::new();
                    if !msg.content.is_empty() {
                        parts.push(GeminiPart::Text {
                            text: msg.content.clone(),
                        });
                    }
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            parts.push(GeminiPart::FunctionCall {
                                function_call: FunctionCall {
                                    name: call.name.clone(),
                                    args: call.arguments.clone(),
                                },
                            });
                        }
                    }
                    contents.push(GeminiContent {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
                MessageRole::Tool => {
                    // The dialect keys results by function name, not id
                    let name = msg
                        .name
                        .clone()
                        .or_else(|| msg.tool_call_id.clone())
                        .unwrap_or_default();
                    contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![GeminiPart::FunctionResponse {
                            function_response: FunctionResponse {
                                name,
                                response: json!({ "result": msg.content }),
                            },
                        }],
                    });
                }
            }
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: system_parts,
            })
        };

        (system_instruction, contents)
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<GeminiTool> {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: convert_schema(&tool.parameters),
                })
                .collect(),
        }]
    }

    fn convert_tool_choice(choice: &ToolChoice) -> ToolConfig {
        let (mode, allowed) = match choice {
            ToolChoice::Auto => ("AUTO", None),
            ToolChoice::None => ("NONE", None),
            ToolChoice::Required => ("ANY", None),
            ToolChoice::Tool(name) => ("ANY", Some(vec![name.clone()])),
        };
        ToolConfig {
            function_calling_config: FunctionCallingConfig {
                mode: mode.to_string(),
                allowed_function_names: allowed,
            },
        }
    }

    fn build_request(&self, request: &CompletionRequest) -> GeminiRequest {
        let (system_instruction, contents) = Self::convert_messages(&request.messages);

        let generation_config = Some(GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_tokens.or(Some(self.config.default_max_tokens)),
            stop_sequences: request.stop.clone(),
        });

        let (tools, tool_config) = if request.tools.is_empty() {
            (None, None)
        } else {
            (
                Some(Self::convert_tools(&request.tools)),
                Some(Self::convert_tool_choice(&request.tool_choice)),
            )
        };

        GeminiRequest {
            contents,
            system_instruction,
            generation_config,
            tools,
            tool_config,
        }
    }

    fn resolve_model<'a>(&'a self, request: &'a CompletionRequest) -> &'a str {
        if request.model.is_empty() {
            &self.config.default_model
        } else {
            &request.model
        }
    }

    fn map_error_body(status: reqwest::StatusCode, body: &str) -> Error {
        if let Ok(error) = serde_json::from_str::<GeminiError>(body) {
            if status.as_u16() == 429 {
                return Error::RateLimit;
            }
            return Error::Api(sanitize_api_error(&format!(
                "{}: {}",
                error.error.status, error.error.message
            )));
        }
        Error::Api(sanitize_api_error(&format!("HTTP {}: {}", status, body)))
    }

    async fn dispatch(&self, url: String, request: &GeminiRequest) -> Result<reqwest::Response> {
        // The URL carries the API key; never log it
        self.http()
            .post(&url)
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
            })
    }
}

/// Derive usage, estimating whatever the vendor failed to report
fn usage_from_metadata(
    metadata: Option<UsageMetadata>,
    input_estimate: u32,
    output_text: &str,
) -> TokenUsage {
    match metadata {
        Some(meta) => match meta.candidates_token_count {
            Some(output) => TokenUsage::exact(meta.prompt_token_count, output),
            // Output count missing mid-generation; estimate rather
            // than bill the output as free
            None => TokenUsage::estimate(meta.prompt_token_count, count_tokens(output_text)),
        },
        None => TokenUsage::estimate(input_estimate, count_tokens(output_text)),
    }
}

#[async_trait::async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
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
        let model = self.resolve_model(&request).to_string();
        let gemini_request = self.build_request(&request);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.base_url, model, self.config.api_key
        );

        debug!("Sending request to Gemini model: {}", model);

        let response = self.dispatch(url, &gemini_request).await?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::map_error_body(status, &body));
        }

        let parsed: GeminiResponse =
            serde_json::from_str(&body).map_err(|e| Error::InvalidResponse(e.to_string()))?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidResponse("No candidates in response".to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            match part {
                GeminiPart::Text { text } => content.push_str(&text),
                GeminiPart::FunctionCall { function_call } => {
                    tool_calls.push(ToolCall {
                        // Gemini doesn't provide IDs
                        id: uuid::Uuid::new_v4().to_string(),
                        name: function_call.name,
                        arguments: function_call.args,
                    });
                }
                GeminiPart::FunctionResponse { .. } => {}
            }
        }

        let usage = usage_from_metadata(
            parsed.usage_metadata,
            count_conversation_tokens(&request.messages),
            &content,
        );

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage,
            finish_reason: candidate.finish_reason,
            model,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn stream_chat(&self, request: CompletionRequest) -> TokenStream {
        let model = self.resolve_model(&request).to_string();
        let input_estimate = count_conversation_tokens(&request.messages);
        let gemini_request = self.build_request(&request);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.config.base_url, model, self.config.api_key
        );

        let response = match self.dispatch(url, &gemini_request).await {
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

/// Decode a Gemini SSE byte stream into `StreamToken`s
///
/// Each `data:` line carries a complete response chunk; the stream has
/// no explicit end sentinel, so a cleanly closed transport terminates
/// with `Done`. Function calls arrive whole (no argument fragments) and
/// are yielded as they appear.
pub(crate) fn decode_stream<S>(source: S, input_estimate: u32) -> TokenStream
where
    S: futures::Stream<Item = std::result::Result<Vec<u8>, String>> + Send + 'static,
{
    Box::pin(stream! {
        futures::pin_mut!(source);

        let mut lines = SseLineBuffer::new();
        let mut usage_metadata: Option<UsageMetadata> = None;
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

                if let Ok(error) = serde_json::from_str::<GeminiError>(data) {
                    yield StreamToken::Error {
                        message: sanitize_api_error(&format!(
                            "{}: {}",
                            error.error.status, error.error.message
                        )),
                    };
                    return;
                }

                let parsed: GeminiResponse = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(error = %e, "skipping malformed stream chunk");
                        continue;
                    }
                };

                if let Some(meta) = parsed.usage_metadata {
                    usage_metadata = Some(meta);
                }

                for candidate in parsed.candidates {
                    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                        match part {
                            GeminiPart::Text { text } => {
                                if !text.is_empty() {
                                    output_text.push_str(&text);
                                    yield StreamToken::Token { content: text };
                                }
                            }
                            GeminiPart::FunctionCall { function_call } => {
                                yield StreamToken::ToolCall {
                                    tool_call: ToolCall {
                                        id: uuid::Uuid::new_v4().to_string(),
                                        name: function_call.name,
                                        arguments: function_call.args,
                                    },
                                };
                            }
                            GeminiPart::FunctionResponse { .. } => {}
                        }
                    }
                }
            }
        }

        let usage = usage_from_metadata(usage_metadata, input_estimate, &output_text);
        yield StreamToken::Done { usage };
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
        let config = GeminiConfig::new("test-key")
            .with_model("gemini-2.5-pro")
            .with_timeout(Duration::from_secs(30));

        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.default_model, "gemini-2.5-pro");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_schema_types_are_uppercased() {
        let schema = json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer"}
            },
            "required": ["count"]
        });

        let converted = convert_schema(&schema);

        assert_eq!(
            converted,
            json!({
                "type": "OBJECT",
                "properties": {
                    "count": {"type": "INTEGER"}
                },
                "required": ["count"]
            })
        );
    }

    #[test]
    fn test_schema_conversion_recurses_through_nesting() {
        let schema = json!({
            "type": "object",
            "properties": {
                "filters": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "field": {"type": "string"},
                            "values": {
                                "type": "array",
                                "items": {"type": "number"}
                            }
                        },
                        "required": ["field"]
                    }
                }
            }
        });

        let converted = convert_schema(&schema);

        assert_eq!(converted["type"], "OBJECT");
        let items = &converted["properties"]["filters"]["items"];
        assert_eq!(items["type"], "OBJECT");
        assert_eq!(items["properties"]["field"]["type"], "STRING");
        assert_eq!(items["properties"]["values"]["items"]["type"], "NUMBER");
        assert_eq!(items["required"], json!(["field"]));
    }

    #[test]
    fn test_schema_conversion_strips_unsupported_fields() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "name": {"type": "string", "default": "x"}
            }
        });

        let converted = convert_schema(&schema);

        assert!(converted.get("$schema").is_none());
        assert!(converted.get("additionalProperties").is_none());
        assert!(converted["properties"]["name"].get("default").is_none());
        assert_eq!(converted["properties"]["name"]["type"], "STRING");
    }

    #[test]
    fn test_deep_nesting_converts_without_issue() {
        // Ten levels of nested properties
        let mut schema = json!({"type": "string"});
        for _ in 0..10 {
            schema = json!({
                "type": "object",
                "properties": { "inner": schema }
            });
        }

        let mut cursor = &convert_schema(&schema);
        for _ in 0..10 {
            assert_eq!(cursor["type"], "OBJECT");
            cursor = &cursor["properties"]["inner"];
        }
        assert_eq!(cursor["type"], "STRING");
    }

    #[test]
    fn test_system_message_hoisted() {
        let messages = vec![Message::system("Be terse"), Message::user("Hello")];

        let (system, contents) = GeminiProvider::convert_messages(&messages);

        assert!(system.is_some());
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn test_tool_results_round_trip_by_name() {
        let messages = vec![
            Message::tool_result("tc_1", "42").with_name("calculator"),
        ];

        let (_, contents) = GeminiProvider::convert_messages(&messages);

        match &contents[0].parts[0] {
            GeminiPart::FunctionResponse { function_response } => {
                assert_eq!(function_response.name, "calculator");
                assert_eq!(function_response.response, json!({"result": "42"}));
            }
            other => panic!("expected function response, got {other:?}"),
        }
    }

    #[test]
    fn test_usage_estimated_when_candidates_count_missing() {
        let usage = usage_from_metadata(
            Some(UsageMetadata {
                prompt_token_count: 50,
                candidates_token_count: None,
            }),
            0,
            "some streamed output text",
        );

        assert!(usage.estimated);
        assert_eq!(usage.input_tokens, 50);
        assert!(usage.output_tokens > 0);

        let exact = usage_from_metadata(
            Some(UsageMetadata {
                prompt_token_count: 50,
                candidates_token_count: Some(12),
            }),
            0,
            "",
        );
        assert_eq!(exact, TokenUsage::exact(50, 12));
    }

    #[tokio::test]
    async fn test_stream_text_then_done() {
        let chunks = vec![
            ok(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#),
            ok(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]}}],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5}}"#),
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
    async fn test_stream_function_call_yields_tool_call() {
        let chunks = vec![
            ok(r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"search","args":{"query":"rust"}}}]}}],"usageMetadata":{"promptTokenCount":8,"candidatesTokenCount":3}}"#),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        assert_eq!(tokens.len(), 2);
        match &tokens[0] {
            StreamToken::ToolCall { tool_call } => {
                assert_eq!(tool_call.name, "search");
                assert_eq!(tool_call.arguments, json!({"query": "rust"}));
                assert!(!tool_call.id.is_empty());
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert!(matches!(tokens[1], StreamToken::Done { .. }));
    }

    #[tokio::test]
    async fn test_stream_missing_usage_is_estimated() {
        let chunks = vec![
            ok(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello world"}]}}]}"#),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 27)).await;

        match tokens.last().unwrap() {
            StreamToken::Done { usage } => {
                assert!(usage.estimated);
                assert_eq!(usage.input_tokens, 27);
                assert!(usage.output_tokens > 0);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_transport_error_terminates_with_error() {
        let chunks = vec![
            ok(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"par"}]}}]}"#),
            Err("connection reset".to_string()),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[1], StreamToken::Error { .. }));
    }

    #[tokio::test]
    async fn test_stream_vendor_error_payload_is_terminal() {
        let chunks = vec![
            ok(r#"{"error":{"code":429,"message":"quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#),
        ];
        let tokens = collect(decode_stream(stream::iter(chunks), 0)).await;

        assert_eq!(tokens.len(), 1);
        assert!(matches!(tokens[0], StreamToken::Error { .. }));
    }
}
