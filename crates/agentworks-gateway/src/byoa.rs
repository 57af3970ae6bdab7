//! BYOA credential resolution
//!
//! Tenants may bring their own vendor API key; when one is present the
//! request runs through a one-shot adapter built around that key and
//! the usage record carries `cost = 0, price = 0`. The tenant pays
//! the vendor directly and must never be double-billed by the
//! platform.
//!
//! Resolution is always an optional enhancement, never a hard
//! dependency: every failure (network, 404, malformed body) resolves
//! to `None` and the caller falls back to platform credentials.

use crate::util::mask_api_key;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// BYOA resolver configuration
#[derive(Clone)]
pub struct ByoaConfig {
    /// Internal API base URL
    pub base_url: String,
    /// Shared secret for the internal endpoint
    pub shared_secret: String,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug implementation to mask the shared secret
impl fmt::Debug for ByoaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByoaConfig")
            .field("base_url", &self.base_url)
            .field("shared_secret", &mask_api_key(&self.shared_secret))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ByoaConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new(base_url: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            shared_secret: shared_secret.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Create configuration from environment variables
    ///
    /// Returns `None` when the internal API is not configured; BYOA
    /// is then simply disabled.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("AGENTWORKS_INTERNAL_API_URL").ok()?;
        let shared_secret = std::env::var("AGENTWORKS_INTERNAL_SECRET").ok()?;
        Some(Self::new(base_url, shared_secret))
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A tenant-supplied vendor credential
///
/// Wire shape mirrors the internal API's camelCase envelope:
/// `{"credential": {"provider", "accessToken", "subscriptionTier"?}}`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByoaCredential {
    /// Vendor the credential belongs to
    pub provider: String,
    /// The tenant's API key/token for that vendor
    pub access_token: String,
    /// Tenant subscription tier, if the platform records one
    #[serde(default)]
    pub subscription_tier: Option<String>,
}

// Custom Debug implementation to mask the access token
impl fmt::Debug for ByoaCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByoaCredential")
            .field("provider", &self.provider)
            .field("access_token", &mask_api_key(&self.access_token))
            .field("subscription_tier", &self.subscription_tier)
            .finish()
    }
}

#[derive(Deserialize)]
struct CredentialEnvelope {
    credential: ByoaCredential,
}

/// Marks a route request as BYOA-eligible
#[derive(Debug, Clone)]
pub struct ByoaBinding {
    /// Tenant to resolve a credential for
    pub tenant_id: String,
    /// Optional agent scoping the credential lookup
    pub agent_name: Option<String>,
}

impl ByoaBinding {
    /// Create a binding for a tenant
    #[must_use]
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            agent_name: None,
        }
    }

    /// Scope the lookup to an agent
    #[must_use]
    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }
}

/// Client for the internal BYOA credential endpoint
pub struct ByoaClient {
    client: Client,
    config: ByoaConfig,
}

impl ByoaClient {
    /// Create a new BYOA client
    #[must_use]
    pub fn new(config: ByoaConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    /// Create from environment variables, if configured
    #[must_use]
    pub fn from_env() -> Option<Self> {
        ByoaConfig::from_env().map(Self::new)
    }

    /// Fetch a tenant's credential
    ///
    /// Never fails: any error resolves to `None` and the caller falls
    /// back to platform credentials.
    pub async fn credential(
        &self,
        tenant_id: &str,
        agent_name: Option<&str>,
    ) -> Option<ByoaCredential> {
        let url = match agent_name {
            Some(agent) => format!(
                "{}/internal/byoa/credential/{}/{}",
                self.config.base_url, tenant_id, agent
            ),
            None => format!(
                "{}/internal/byoa/credential/{}",
                self.config.base_url, tenant_id
            ),
        };

        let response = match self
            .client
            .get(&url)
            .header("x-internal-secret", &self.config.shared_secret)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, tenant = tenant_id, "BYOA credential fetch failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            // 404 is the normal "tenant has no credential" answer
            debug!(status = %status, tenant = tenant_id, "no BYOA credential");
            return None;
        }

        match response.json::<CredentialEnvelope>().await {
            Ok(envelope) => Some(envelope.credential),
            Err(e) => {
                warn!(error = %e, tenant = tenant_id, "malformed BYOA credential response");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_debug_masks_secret() {
        let config = ByoaConfig::new("http://core:4000", "super-secret-value");
        let debug_str = format!("{:?}", config);

        assert!(!debug_str.contains("super-secret-value"));
        assert!(debug_str.contains("http://core:4000"));
    }

    #[test]
    fn test_credential_debug_masks_token() {
        let credential = ByoaCredential {
            provider: "openai".to_string(),
            access_token: "sk-1234567890abcdefghij".to_string(),
            subscription_tier: Some("pro".to_string()),
        };
        let debug_str = format!("{:?}", credential);

        assert!(!debug_str.contains("1234567890"));
        assert!(debug_str.contains("openai"));
    }

    #[test]
    fn test_credential_envelope_parsing() {
        let envelope: CredentialEnvelope = serde_json::from_str(
            r#"{"credential":{"provider":"anthropic","accessToken":"sk-ant-xyz"}}"#,
        )
        .unwrap();

        assert_eq!(envelope.credential.provider, "anthropic");
        assert_eq!(envelope.credential.access_token, "sk-ant-xyz");
        assert_eq!(envelope.credential.subscription_tier, None);
    }

    #[test]
    fn test_malformed_credential_body_fails_parse() {
        assert!(serde_json::from_str::<CredentialEnvelope>(r#"{"credential":{}}"#).is_err());
        assert!(serde_json::from_str::<CredentialEnvelope>("not json").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_resolves_to_none() {
        let client = ByoaClient::new(
            ByoaConfig::new("http://127.0.0.1:1", "secret")
                .with_timeout(Duration::from_millis(200)),
        );

        assert!(client.credential("tenant-1", None).await.is_none());
        assert!(client.credential("tenant-1", Some("agent")).await.is_none());
    }

    #[test]
    fn test_binding_builder() {
        let binding = ByoaBinding::new("tenant-1").with_agent("researcher");
        assert_eq!(binding.tenant_id, "tenant-1");
        assert_eq!(binding.agent_name.as_deref(), Some("researcher"));
    }
}
