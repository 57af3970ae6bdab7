//! Error types for agentworks-metering

use thiserror::Error;

/// Metering store error type
///
/// These errors never cross the request path of the gateway: every
/// caller in this crate either absorbs them (usage tracking, health
/// caching) or degrades open (rate limiting).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or rejected a command
    #[error("store backend error: {0}")]
    Backend(String),

    /// A cached payload failed to serialize or deserialize
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;
