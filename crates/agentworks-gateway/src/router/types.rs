//! Routing request and result types

use crate::byoa::ByoaBinding;
use crate::completion::{CompletionRequest, CompletionResponse, TokenUsage};
use crate::tools::ToolCall;
use serde::Serialize;

/// A routed completion request
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Workspace (tenant) making the request
    pub workspace_id: String,
    /// The completion to run
    pub request: CompletionRequest,
    /// BYOA override; when set and resolvable, the tenant's own
    /// credential is used and nothing is billed to the platform
    pub byoa: Option<ByoaBinding>,
    /// Free-form metadata carried into the usage event
    pub metadata: Option<serde_json::Value>,
}

impl RouteRequest {
    /// Create a request for a workspace
    #[must_use]
    pub fn new(workspace_id: impl Into<String>, request: CompletionRequest) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            request,
            byoa: None,
            metadata: None,
        }
    }

    /// Mark the request BYOA-eligible
    #[must_use]
    pub fn with_byoa(mut self, binding: ByoaBinding) -> Self {
        self.byoa = Some(binding);
        self
    }

    /// Attach metadata for the usage event
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A routed completion result
///
/// `cost` is fixed here, at response time, from the router's pricing
/// table; it is never re-derived later against an updated table.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    /// Generated text content
    pub content: String,
    /// Tool calls requested by the model
    pub tool_calls: Vec<ToolCall>,
    /// Token usage
    pub usage: TokenUsage,
    /// Model that served the request
    pub model: String,
    /// Provider that served the request
    pub provider: String,
    /// Finish reason
    pub finish_reason: Option<String>,
    /// Platform cost in USD (0 for BYOA requests)
    pub cost: f64,
    /// Price charged to the workspace in USD (0 for BYOA requests)
    pub price: f64,
}

impl RouteResult {
    pub(crate) fn assemble(
        response: CompletionResponse,
        provider: &str,
        cost: f64,
        price: f64,
    ) -> Self {
        Self {
            content: response.content,
            tool_calls: response.tool_calls,
            usage: response.usage,
            model: response.model,
            provider: provider.to_string(),
            finish_reason: response.finish_reason,
            cost,
            price,
        }
    }
}
