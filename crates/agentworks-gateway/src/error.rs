//! Error types for agentworks-gateway

use thiserror::Error;

/// Gateway error type
///
/// Only genuinely request-blocking failures cross the gateway boundary:
/// an unrouteable provider or a failed vendor call. Accounting-side
/// failures are absorbed inside `agentworks-metering` and never surface
/// here. During streaming these same failures become a terminal error
/// token instead of an `Err`.
#[derive(Debug, Error)]
pub enum Error {
    /// Requested provider has no registered adapter; never retried
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Provider short-circuited by its rolling failure counter
    #[error("provider {provider} unavailable after {failures} recent failures")]
    ProviderUnavailable {
        /// Provider that was short-circuited
        provider: String,
        /// Failure count that tripped the threshold
        failures: u64,
    },

    /// Vendor API rejected the request (4xx/5xx, malformed response)
    #[error("api error: {0}")]
    Api(String),

    /// Vendor rate limit exceeded
    #[error("rate limit exceeded")]
    RateLimit,

    /// Vendor response could not be parsed
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Network-level failure reaching the vendor
    #[error("network error: {0}")]
    Network(String),

    /// Request timed out
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Provider credentials or configuration missing
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
