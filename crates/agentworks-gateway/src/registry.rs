//! Provider registry and adapter factory
//!
//! The registry is the single indirection point for adding a vendor:
//! the router resolves adapters by name and nothing else in the
//! gateway knows which concrete providers exist. The factory builds
//! fresh one-shot adapters (used for BYOA credentials) and is injected
//! into the router so tests can substitute mocks. Adapter lifetime is
//! owned here, not by hidden module-level singletons.

use crate::anthropic::{AnthropicConfig, AnthropicProvider};
use crate::error::{Error, Result};
use crate::gemini::{GeminiConfig, GeminiProvider};
use crate::openai::{OpenAiConfig, OpenAiProvider};
use crate::provider::ChatProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a fresh adapter for a provider name and API key
pub type AdapterFactory = Arc<dyn Fn(&str, &str) -> Result<Arc<dyn ChatProvider>> + Send + Sync>;

/// Maps provider names to their adapters
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every provider whose environment credentials resolve
    #[must_use]
    pub fn from_env() -> Self {
        let mut registry = Self::new();

        match OpenAiProvider::from_env() {
            Ok(provider) => registry.register("openai", Arc::new(provider)),
            Err(e) => debug!(error = %e, "openai provider not registered"),
        }
        match AnthropicProvider::from_env() {
            Ok(provider) => registry.register("anthropic", Arc::new(provider)),
            Err(e) => debug!(error = %e, "anthropic provider not registered"),
        }
        match GeminiProvider::from_env() {
            Ok(provider) => registry.register("gemini", Arc::new(provider)),
            Err(e) => debug!(error = %e, "gemini provider not registered"),
        }

        registry
    }

    /// Register a provider
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ChatProvider>) {
        let name = name.into();
        debug!(provider = %name, "Registering provider");
        self.providers.insert(name, provider);
    }

    /// Get a provider by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(name).cloned()
    }

    /// Check if a provider is registered
    #[must_use]
    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// List registered provider names
    #[must_use]
    pub fn list_providers(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

/// Build a fresh adapter with an explicit API key
///
/// Used for BYOA one-shot calls: the returned adapter holds its own
/// client and is never shared with platform-credential traffic.
pub fn build_adapter(provider: &str, api_key: &str) -> Result<Arc<dyn ChatProvider>> {
    match provider {
        "openai" => Ok(Arc::new(OpenAiProvider::new(OpenAiConfig::new(api_key)))),
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(AnthropicConfig::new(
            api_key,
        )))),
        "gemini" | "google" => Ok(Arc::new(GeminiProvider::new(GeminiConfig::new(api_key)))),
        other => Err(Error::UnknownProvider(other.to_string())),
    }
}

/// The default factory, backed by `build_adapter`
#[must_use]
pub fn default_adapter_factory() -> AdapterFactory {
    Arc::new(build_adapter)
}
