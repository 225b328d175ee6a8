use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::time::Instant;

use crate::error::{ClassifiedError, ClassifiedResult};
use crate::types::{HealthRecord, ProviderKind, Request, Response};

/// One incremental token (or token fragment) emitted by `Adapter::stream`.
pub type StreamChunk = ClassifiedResult<String>;

/// The capability set required of every backend-specific strategy. An
/// adapter is chosen once at provider registration and stored as the
/// polymorphic field of the provider handle (Design Notes, "dynamic
/// provider types keyed by string").
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The provider kind this adapter speaks.
    fn kind(&self) -> ProviderKind;

    /// Execute a single non-streaming call, honoring `deadline`.
    async fn dispatch(&self, request: &Request, deadline: Instant) -> ClassifiedResult<Response>;

    /// Execute a streaming call; chunks arrive in generation order.
    async fn stream(
        &self,
        request: &Request,
        deadline: Instant,
    ) -> ClassifiedResult<BoxStream<'static, StreamChunk>>;

    /// Issue a short synthetic request with a tight timeout for the health
    /// registry's periodic probe (§4.3). Probe failures never open the
    /// breaker directly; they only flip `healthy` to false.
    async fn health_probe(&self, deadline: Instant) -> ClassifiedResult<HealthRecord>;

    /// Release any held resources (connections, background tasks). Called
    /// on provider deregistration.
    async fn close(&self);
}

/// Helper for adapters to build a timeout classification uniformly.
pub fn timeout_error(provider: &str) -> ClassifiedError {
    ClassifiedError::new(
        provider,
        crate::error::ErrorKind::Timeout,
        "deadline exceeded before a response was received",
    )
}
