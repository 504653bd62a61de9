pub mod error;
pub mod http;

use async_trait::async_trait;
use error::ProviderError;

/// Outbound model client - the only thing the resilience layer calls
/// to reach an LLM endpoint.
///
/// Implementations must surface provider failures as [`ProviderError`]
/// so they can be classified by kind.
#[async_trait]
pub trait ModelClient: Send + Sync {
    type Request: Send + Sync;
    type Response: Send;

    /// Send `request` to the endpoint (model) named `endpoint`
    async fn invoke(
        &self,
        endpoint: &str,
        request: &Self::Request,
    ) -> Result<Self::Response, ProviderError>;
}

// Re-export provider implementations
pub use http::{HttpClientConfig, HttpModelClient};
