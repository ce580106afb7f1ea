//! Upstream model providers.
//!
//! - [`traits`]: the [`ModelProvider`] contract every backend implements.
//! - [`registry`]: descriptors (priority, capability tags, rate limit) in
//!   deterministic candidate order.
//! - [`health`]: per-provider rate windows and circuit breakers.
//! - [`backoff`]: circuit-open durations.
//! - [`backpressure`]: bounded, cancellable token channels.
//! - [`http`]: streaming client for OpenAI-compatible endpoints.

pub mod backoff;
pub mod backpressure;
pub mod health;
pub mod http;
pub mod registry;
pub mod traits;

pub use backoff::CircuitBackoff;
pub use backpressure::{DEFAULT_STREAM_BUFFER, bounded_stream};
pub use health::{HealthTracker, ProviderHealth};
pub use http::HttpProvider;
pub use registry::{ProviderDescriptor, ProviderRegistry, RateLimit, RegisteredProvider};
pub use traits::ModelProvider;
