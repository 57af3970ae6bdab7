//! Router - provider selection, dispatch and accounting
//!
//! The router is the gateway's front door: it resolves the adapter for
//! a named provider, optionally short-circuits providers with a
//! failure streak, dispatches the request, prices the result from the
//! static table, and records usage fire-and-forget.
//!
//! # Module Structure
//!
//! - `types`: RouteRequest / RouteResult
//! - `router_impl`: ProviderRouter implementation
//! - `mock`: scriptable provider for tests

mod mock;
mod router_impl;
mod types;

#[cfg(test)]
mod tests;

pub use mock::MockProvider;
pub use router_impl::ProviderRouter;
pub use types::{RouteRequest, RouteResult};
