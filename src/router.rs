//! Provider selection and failover.
//!
//! [`Router::route`] walks the candidate list the [`HealthTracker`] hands
//! out, one provider at a time:
//!
//! ```text
//! loop:
//!   select(task, tried) ── None ──► AllProvidersUnavailable
//!        │
//!        ▼
//!   dispatch ── send + first token within the provider timeout
//!        │
//!        ├─ ok ──────────────► RoutedStream (first token replayed)
//!        ├─ provider failure ─► record_failure, add to tried, loop
//!        ├─ cancelled ───────► RequestCancelled (health untouched)
//!        └─ other error ─────► returned as-is
//! ```
//!
//! Failover only happens before the first token. Once a provider has
//! started answering, tokens may already be downstream, so a mid-stream
//! failure is recorded against that provider and surfaced on the stream.
//! The same timeout bounds the gap between consecutive tokens; a provider
//! that stalls mid-answer ends the stream with `ProviderTimeout`.
//! The number of attempts is bounded by the number of registered providers.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::clock::SharedClock;
use crate::config::RouterConfig;
use crate::executor::BoundedExecutor;
use crate::providers::{
    CircuitBackoff, HealthTracker, ProviderRegistry, RegisteredProvider, bounded_stream,
};
use crate::telemetry;
use crate::types::{RoutingRequest, TokenStream};
use crate::{Result, SwitchboardError};

/// Chooses a provider per request and fails over between them.
pub struct Router {
    tracker: Arc<HealthTracker>,
    default_timeout: Duration,
    stream_buffer: usize,
}

impl Router {
    pub fn new(registry: Arc<ProviderRegistry>, config: &RouterConfig, clock: SharedClock) -> Self {
        let tracker = HealthTracker::new(
            registry,
            config.circuit_breaker_threshold,
            CircuitBackoff::from(config),
            clock,
        );
        Self {
            tracker: Arc::new(tracker),
            default_timeout: config.provider_timeout(),
            stream_buffer: config.stream_buffer,
        }
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        self.tracker.registry()
    }

    /// Route a request to the best available provider.
    #[instrument(skip(self, request), fields(task = ?request.task_type, category = %request.category))]
    pub async fn route(&self, request: &RoutingRequest) -> Result<RoutedStream> {
        let max_attempts = self.registry().len();
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = 0;

        while attempts < max_attempts {
            if request.is_cancelled() {
                return Err(SwitchboardError::RequestCancelled);
            }
            let Some(candidate) = self.tracker.select_and_reserve(request.task_type, &tried)
            else {
                break;
            };
            attempts += 1;
            let name = candidate.name().to_owned();
            tried.insert(name.clone());
            debug!(provider = %name, attempt = attempts, "dispatching");

            let started = Instant::now();
            match self.open(&candidate, request).await {
                Ok((first, stream)) => {
                    let token_timeout = self.timeout_for(&candidate);
                    return Ok(RoutedStream {
                        first: Some(first),
                        inner: stream,
                        tracker: self.tracker.clone(),
                        provider: name,
                        cancel: request.cancel.clone(),
                        started,
                        token_timeout,
                        deadline: Box::pin(tokio::time::sleep(token_timeout)),
                        finished: false,
                    });
                }
                Err(e) if e.is_cancellation() => {
                    record_request(&name, "cancelled");
                    return Err(e);
                }
                Err(e) if e.is_provider_failure() => {
                    record_request(&name, "error");
                    self.tracker.record_failure(&name, &e);
                }
                Err(e) => {
                    record_request(&name, "error");
                    warn!(provider = %name, error = %e, "provider returned a terminal error");
                    return Err(e);
                }
            }
        }

        warn!(attempts, "no provider available");
        Err(SwitchboardError::AllProvidersUnavailable { attempts })
    }

    fn timeout_for(&self, candidate: &RegisteredProvider) -> Duration {
        candidate.descriptor.timeout.unwrap_or(self.default_timeout)
    }

    /// Send the prompt and wait for the first token, bounded by the
    /// provider's timeout and the request's cancellation.
    async fn open(
        &self,
        candidate: &RegisteredProvider,
        request: &RoutingRequest,
    ) -> Result<(String, TokenStream)> {
        let timeout = self.timeout_for(candidate);
        let connect = async {
            let stream = candidate
                .provider
                .send(&request.prompt, &request.cancel)
                .await?;
            let mut stream = bounded_stream(stream, self.stream_buffer, request.cancel.clone());
            match stream.next().await {
                Some(Ok(first)) => Ok((first, stream)),
                Some(Err(e)) => Err(e),
                None if request.is_cancelled() => Err(SwitchboardError::RequestCancelled),
                None => Err(SwitchboardError::EmptyResponse),
            }
        };

        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(SwitchboardError::RequestCancelled),
            result = tokio::time::timeout(timeout, connect) => result.unwrap_or_else(|_| {
                Err(SwitchboardError::ProviderTimeout {
                    provider: candidate.name().to_owned(),
                    elapsed: timeout,
                })
            }),
        }
    }

    /// Probe every provider through the executor and fold results into health.
    ///
    /// Probes that could not get an executor slot are reported but do not
    /// count against the provider.
    pub async fn probe_all(&self, executor: &BoundedExecutor) -> Vec<ProbeOutcome> {
        let probes = self.registry().iter().map(|entry| {
            let provider = entry.provider.clone();
            let name = entry.name().to_owned();
            async move {
                let result = executor
                    .submit(async move { provider.probe().await })
                    .await
                    .and_then(|probe| probe);
                (name, result)
            }
        });

        let mut outcomes = Vec::new();
        for (provider, result) in futures_util::future::join_all(probes).await {
            let healthy = match &result {
                Ok(()) => {
                    self.tracker.record_success(&provider);
                    true
                }
                Err(e) if e.is_provider_failure() => {
                    self.tracker.record_failure(&provider, e);
                    false
                }
                Err(e) => {
                    debug!(provider = %provider, error = %e, "probe skipped");
                    false
                }
            };
            outcomes.push(ProbeOutcome {
                provider,
                healthy,
                error: result.err().map(|e| e.to_string()),
            });
        }
        outcomes
    }
}

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub provider: String,
    pub healthy: bool,
    pub error: Option<String>,
}

fn record_request(provider: &str, status: &'static str) {
    metrics::counter!(telemetry::REQUESTS_TOTAL,
        "provider" => provider.to_owned(),
        "status" => status,
    )
    .increment(1);
}

/// Token stream from the provider that accepted the request.
///
/// Replays the first token (consumed during dispatch), then forwards the
/// rest. On completion it records success with the health tracker; a
/// provider error mid-stream is recorded as a failure and yielded. Each
/// token must arrive within the provider's timeout of the previous one,
/// otherwise the stream yields [`SwitchboardError::ProviderTimeout`]. If the
/// request is cancelled the stream ends with
/// [`SwitchboardError::RequestCancelled`] and health is left untouched.
pub struct RoutedStream {
    first: Option<String>,
    inner: TokenStream,
    tracker: Arc<HealthTracker>,
    provider: String,
    cancel: CancellationToken,
    started: Instant,
    token_timeout: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
    finished: bool,
}

impl std::fmt::Debug for RoutedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedStream")
            .field("provider", &self.provider)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl RoutedStream {
    /// Name of the provider serving this stream.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn finish(&mut self, status: &'static str) {
        self.finished = true;
        record_request(&self.provider, status);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
            "provider" => self.provider.clone(),
        )
        .record(self.started.elapsed().as_secs_f64());
    }
}

impl Stream for RoutedStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(first) = this.first.take() {
            let next = tokio::time::Instant::now() + this.token_timeout;
            this.deadline.as_mut().reset(next);
            return Poll::Ready(Some(Ok(first)));
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(token))) => {
                let next = tokio::time::Instant::now() + this.token_timeout;
                this.deadline.as_mut().reset(next);
                Poll::Ready(Some(Ok(token)))
            }
            Poll::Ready(Some(Err(e))) if e.is_cancellation() => {
                this.finish("cancelled");
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish("error");
                if e.is_provider_failure() {
                    this.tracker.record_failure(&this.provider, &e);
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) if this.cancel.is_cancelled() => {
                this.finish("cancelled");
                Poll::Ready(Some(Err(SwitchboardError::RequestCancelled)))
            }
            Poll::Ready(None) => {
                this.finish("ok");
                this.tracker.record_success(&this.provider);
                Poll::Ready(None)
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    let e = SwitchboardError::ProviderTimeout {
                        provider: this.provider.clone(),
                        elapsed: this.token_timeout,
                    };
                    warn!(provider = %this.provider, "provider stalled mid-stream");
                    this.finish("error");
                    this.tracker.record_failure(&this.provider, &e);
                    Poll::Ready(Some(Err(e)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
