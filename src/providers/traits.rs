//! Provider contract.
//!
//! Every backend implements one small trait, [`ModelProvider`]: a name and a
//! streaming `send`. The router never inspects what kind of backend it is
//! talking to; selection is driven by the descriptor registered alongside
//! the provider (see [`ProviderRegistry`](super::ProviderRegistry)).
//!
//! # Error semantics
//!
//! - Errors for which [`SwitchboardError::is_provider_failure()`] is true
//!   (timeouts, 5xx, rate limits, transport failures) are recorded against
//!   the provider's health and make the router try the next candidate.
//! - [`SwitchboardError::RequestCancelled`] is never counted as a failure.
//! - Anything else is terminal for the request.
//!
//! # Example
//!
//! ```ignore
//! struct Echo;
//!
//! #[async_trait]
//! impl ModelProvider for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn send(&self, prompt: &str, _cancel: &CancellationToken) -> Result<TokenStream> {
//!         let tokens = vec![Ok(prompt.to_string())];
//!         Ok(Box::pin(futures_util::stream::iter(tokens)))
//!     }
//! }
//! ```
//!
//! [`SwitchboardError::is_provider_failure()`]: crate::SwitchboardError::is_provider_failure
//! [`SwitchboardError::RequestCancelled`]: crate::SwitchboardError::RequestCancelled

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::types::TokenStream;

/// A generative backend reachable by the router.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logging/debugging. Must be unique per registry.
    fn name(&self) -> &str;

    /// Start generating a response for `prompt`.
    ///
    /// Resolves once the provider has accepted the request; tokens then
    /// arrive on the returned stream in generation order. Implementations
    /// should stop producing when `cancel` fires.
    async fn send(&self, prompt: &str, cancel: &CancellationToken) -> Result<TokenStream>;

    /// Cheap liveness check used by background health probes.
    ///
    /// Default implementation reports healthy without a network call.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}
