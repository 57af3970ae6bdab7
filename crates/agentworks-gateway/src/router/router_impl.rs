//! ProviderRouter implementation

use super::types::{RouteRequest, RouteResult};
use crate::byoa::{ByoaBinding, ByoaClient, ByoaCredential};
use crate::completion::CompletionResponse;
use crate::error::{Error, Result};
use crate::pricing::{CostEstimate, PricingTable};
use crate::provider::ChatProvider;
use crate::registry::{default_adapter_factory, AdapterFactory, ProviderRegistry};
use crate::stream::{StreamToken, TokenStream};
use agentworks_metering::{UsageEvent, UsageTracker};
use async_stream::stream;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Routes completion requests to provider adapters
///
/// Constructed per process and shared behind an `Arc`; everything the
/// router needs (registry, pricing, tracker, BYOA resolver, adapter
/// factory) is injected at construction.
pub struct ProviderRouter {
    registry: ProviderRegistry,
    pricing: PricingTable,
    tracker: Option<Arc<UsageTracker>>,
    byoa: Option<ByoaClient>,
    adapter_factory: AdapterFactory,
    /// Failure-streak short-circuit threshold; `None` leaves the
    /// counters as an observability signal only
    failure_threshold: Option<u64>,
}

impl ProviderRouter {
    /// Create a router over a registry and pricing table
    #[must_use]
    pub fn new(registry: ProviderRegistry, pricing: PricingTable) -> Self {
        Self {
            registry,
            pricing,
            tracker: None,
            byoa: None,
            adapter_factory: default_adapter_factory(),
            failure_threshold: None,
        }
    }

    /// Attach a usage tracker
    #[must_use]
    pub fn with_usage_tracker(mut self, tracker: Arc<UsageTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Attach a BYOA credential resolver
    #[must_use]
    pub fn with_byoa_client(mut self, client: ByoaClient) -> Self {
        self.byoa = Some(client);
        self
    }

    /// Enable the failure-streak short-circuit at `threshold` failures
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u64) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Replace the one-shot adapter factory (used by tests)
    #[must_use]
    pub fn with_adapter_factory(mut self, factory: AdapterFactory) -> Self {
        self.adapter_factory = factory;
        self
    }

    /// The registry backing this router
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Register a provider
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ChatProvider>) {
        self.registry.register(name, provider);
    }

    /// Pre-flight cost/price estimate
    ///
    /// Pure: given the same pricing table and token counts this is
    /// bit-for-bit equal to the cost of a completed response.
    #[must_use]
    pub fn estimate_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> CostEstimate {
        self.pricing.estimate(model, input_tokens, output_tokens)
    }

    /// Complete a request through a named provider
    ///
    /// A BYOA binding that resolves takes precedence over the platform
    /// path; a binding that fails to resolve falls back silently.
    #[instrument(skip(self, request), fields(workspace = %request.workspace_id))]
    pub async fn complete(&self, provider_name: &str, request: RouteRequest) -> Result<RouteResult> {
        if let Some(binding) = request.byoa.clone() {
            if let Some(credential) = self.resolve_byoa(&binding).await {
                return self.complete_with_credential(&credential, &request).await;
            }
            debug!(tenant = %binding.tenant_id, "BYOA unresolved, using platform credentials");
        }

        let adapter = self.adapter(provider_name)?;
        self.ensure_available(provider_name).await?;

        let started = Instant::now();
        match adapter.complete(request.request.clone()).await {
            Ok(response) => {
                let cost = self.pricing.cost(
                    &response.model,
                    response.usage.input_tokens,
                    response.usage.output_tokens,
                );
                let price = self.pricing.price(cost);
                self.record_completion(&request, &response, provider_name, cost, price, started);
                Ok(RouteResult::assemble(response, provider_name, cost, price))
            }
            Err(e) => {
                self.record_failure(provider_name).await;
                Err(e)
            }
        }
    }

    /// Run a one-shot completion with a tenant credential
    ///
    /// The adapter is built fresh around the tenant's key and never
    /// shares a client with platform traffic. The usage record carries
    /// `cost = 0, price = 0`: BYOA usage is never billed to the
    /// platform.
    pub async fn complete_with_credential(
        &self,
        credential: &ByoaCredential,
        request: &RouteRequest,
    ) -> Result<RouteResult> {
        let adapter = (self.adapter_factory)(&credential.provider, &credential.access_token)?;
        let provider = credential.provider.clone();

        let started = Instant::now();
        match adapter.complete(request.request.clone()).await {
            Ok(response) => {
                self.record_completion(request, &response, &provider, 0.0, 0.0, started);
                Ok(RouteResult::assemble(response, &provider, 0.0, 0.0))
            }
            Err(e) => {
                self.record_failure(&provider).await;
                Err(e)
            }
        }
    }

    /// Stream a request through a named provider
    ///
    /// The returned stream forwards adapter tokens untouched; the
    /// terminal `Done` triggers usage recording and a terminal `Error`
    /// increments the provider's failure counter.
    #[instrument(skip(self, request), fields(workspace = %request.workspace_id))]
    pub async fn stream(&self, provider_name: &str, request: RouteRequest) -> Result<TokenStream> {
        if let Some(binding) = request.byoa.clone() {
            if let Some(credential) = self.resolve_byoa(&binding).await {
                return self.stream_with_credential(&credential, request).await;
            }
            debug!(tenant = %binding.tenant_id, "BYOA unresolved, using platform credentials");
        }

        let adapter = self.adapter(provider_name)?;
        self.ensure_available(provider_name).await?;

        let model = resolve_model(&request, adapter.as_ref());
        let inner = adapter.stream_chat(request.request.clone()).await;
        Ok(self.wrap_stream(inner, provider_name.to_string(), model, request, false))
    }

    /// Stream a one-shot completion with a tenant credential
    pub async fn stream_with_credential(
        &self,
        credential: &ByoaCredential,
        request: RouteRequest,
    ) -> Result<TokenStream> {
        let adapter = (self.adapter_factory)(&credential.provider, &credential.access_token)?;
        let model = resolve_model(&request, adapter.as_ref());
        let inner = adapter.stream_chat(request.request.clone()).await;
        Ok(self.wrap_stream(inner, credential.provider.clone(), model, request, true))
    }

    fn adapter(&self, provider_name: &str) -> Result<Arc<dyn ChatProvider>> {
        self.registry
            .get(provider_name)
            .ok_or_else(|| Error::UnknownProvider(provider_name.to_string()))
    }

    async fn resolve_byoa(&self, binding: &ByoaBinding) -> Option<ByoaCredential> {
        let client = self.byoa.as_ref()?;
        client
            .credential(&binding.tenant_id, binding.agent_name.as_deref())
            .await
    }

    /// Short-circuit a provider whose failure streak reached the
    /// configured threshold; advisory and deterministic for a given
    /// counter state, disabled when no threshold is set.
    async fn ensure_available(&self, provider: &str) -> Result<()> {
        let Some(threshold) = self.failure_threshold else {
            return Ok(());
        };
        let Some(tracker) = &self.tracker else {
            return Ok(());
        };

        let failures = tracker.provider_failures(provider).await;
        if failures >= threshold {
            warn!(provider, failures, "short-circuiting provider over failure threshold");
            return Err(Error::ProviderUnavailable {
                provider: provider.to_string(),
                failures,
            });
        }
        Ok(())
    }

    async fn record_failure(&self, provider: &str) {
        if let Some(tracker) = &self.tracker {
            let failures = tracker.record_failure(provider).await;
            if self.failure_threshold.is_some_and(|t| failures >= t) {
                tracker.cache_provider_health(provider, false).await;
            }
        }
    }

    /// Fire-and-forget usage recording; never delays or fails the
    /// caller's response.
    fn record_completion(
        &self,
        request: &RouteRequest,
        response: &CompletionResponse,
        provider: &str,
        cost: f64,
        price: f64,
        started: Instant,
    ) {
        let Some(tracker) = &self.tracker else {
            return;
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let event = UsageEvent {
            workspace_id: request.workspace_id.clone(),
            provider: provider.to_string(),
            model: response.model.clone(),
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            cost,
            price,
            timestamp: Utc::now(),
            latency_ms: Some(latency_ms),
            metadata: request.metadata.clone(),
        };

        let tracker = Arc::clone(tracker);
        let provider = provider.to_string();
        tokio::spawn(async move {
            tracker.record_provider_latency(&provider, latency_ms).await;
            tracker.record_success(&provider).await;
            tracker.track_usage(&event).await;
        });
    }

    fn wrap_stream(
        &self,
        inner: TokenStream,
        provider: String,
        model: String,
        request: RouteRequest,
        byoa: bool,
    ) -> TokenStream {
        let tracker = self.tracker.clone();
        let pricing = self.pricing.clone();

        Box::pin(stream! {
            let started = Instant::now();
            let mut inner = inner;

            while let Some(token) = inner.next().await {
                match token {
                    StreamToken::Done { usage } => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        let (cost, price) = if byoa {
                            (0.0, 0.0)
                        } else {
                            let cost =
                                pricing.cost(&model, usage.input_tokens, usage.output_tokens);
                            (cost, pricing.price(cost))
                        };

                        if let Some(tracker) = tracker.as_ref() {
                            let event = UsageEvent {
                                workspace_id: request.workspace_id.clone(),
                                provider: provider.clone(),
                                model: model.clone(),
                                input_tokens: usage.input_tokens,
                                output_tokens: usage.output_tokens,
                                cost,
                                price,
                                timestamp: Utc::now(),
                                latency_ms: Some(latency_ms),
                                metadata: request.metadata.clone(),
                            };
                            let tracker = Arc::clone(tracker);
                            let provider = provider.clone();
                            tokio::spawn(async move {
                                tracker.record_provider_latency(&provider, latency_ms).await;
                                tracker.record_success(&provider).await;
                                tracker.track_usage(&event).await;
                            });
                        }

                        yield StreamToken::Done { usage };
                        return;
                    }
                    StreamToken::Error { message } => {
                        if let Some(tracker) = tracker.as_ref() {
                            tracker.record_failure(&provider).await;
                        }
                        yield StreamToken::Error { message };
                        return;
                    }
                    other => yield other,
                }
            }
        })
    }
}

fn resolve_model(request: &RouteRequest, adapter: &dyn ChatProvider) -> String {
    if request.request.model.is_empty() {
        adapter.default_model().to_string()
    } else {
        request.request.model.clone()
    }
}
