//! Integration facade.
//!
//! [`Assistant`] is the one entry point feature modules call. It composes
//! the cache, router, segmenter and executor:
//!
//! ```text
//! ask ─► Cache::lookup ── hit ──────────────────────────► sentences
//!            │
//!           miss ─► Router::route ─► Segmenter ─► sentences
//!                        │                 └─► Cache::put (complete, not cancelled)
//!                        └─ AllProvidersUnavailable ─► stale entry ─► canned fallback
//! ```
//!
//! Sentences are delivered through a bounded channel, so a slow consumer
//! holds back the provider stream behind it.

mod builder;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, join_all};
use futures_util::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Cache, CacheStats};
use crate::executor::{BoundedExecutor, ResourceMonitor, ResourceUsage};
use crate::providers::ProviderHealth;
use crate::router::{ProbeOutcome, Router};
use crate::streaming::{Segmenter, StreamLatencies, StreamTimer, StreamingLatency};
use crate::types::{CacheTier, Category, RoutingRequest, TaskType, TokenStream};
use crate::{Result, SwitchboardError};

pub use builder::AssistantBuilder;

/// `(query, value)` pairs a prefetch hint wants cached.
pub type PrefetchFuture = BoxFuture<'static, Result<Vec<(String, String)>>>;

type PrefetchHint = Arc<dyn Fn() -> PrefetchFuture + Send + Sync>;

/// Optional features, decided once when the assistant is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// L2 opened successfully; enables stale fallback.
    pub persistent_cache: bool,
    /// L3 similarity lookup is enabled.
    pub semantic_cache: bool,
    /// A canned response is configured for total outages.
    pub canned_fallback: bool,
    /// Memory sampling and executor throttling are active.
    pub resource_monitor: bool,
}

/// Read-only view for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache: CacheStats,
    pub providers: Vec<ProviderHealth>,
    pub streaming: StreamingLatency,
    pub resources: ResourceUsage,
}

/// Sentence stream returned by [`Assistant::ask`].
pub type SentenceStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Answer to one [`Assistant::ask`] call.
pub struct AskResponse {
    sentences: SentenceStream,
    /// Served from a cache tier without calling a provider.
    pub cache_hit: bool,
    /// Tier that served the answer, for hits and stale answers.
    pub tier: Option<CacheTier>,
    /// Past its TTL; served because no provider could answer.
    pub stale: bool,
    /// The configured canned response.
    pub fallback: bool,
    /// Provider streaming the answer, on a miss.
    pub provider: Option<String>,
    cancel: CancellationToken,
}

impl AskResponse {
    /// Stop the request. Sentences already received stay valid; nothing is cached.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain every sentence and join them with single spaces.
    pub async fn text(mut self) -> Result<String> {
        let mut sentences = Vec::new();
        while let Some(sentence) = self.sentences.next().await {
            sentences.push(sentence?);
        }
        Ok(sentences.join(" "))
    }
}

impl Stream for AskResponse {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.sentences.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for AskResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AskResponse")
            .field("cache_hit", &self.cache_hit)
            .field("tier", &self.tier)
            .field("stale", &self.stale)
            .field("fallback", &self.fallback)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Routing, caching and streaming behind a single `ask`.
pub struct Assistant {
    cache: Arc<Cache>,
    router: Arc<Router>,
    executor: Arc<BoundedExecutor>,
    monitor: Option<Arc<ResourceMonitor>>,
    latencies: Arc<StreamLatencies>,
    hints: RwLock<HashMap<Category, Vec<PrefetchHint>>>,
    capabilities: Capabilities,
    min_sentence_chars: usize,
    sentence_buffer: usize,
    fallback_response: Option<String>,
}

impl Assistant {
    pub fn builder() -> AssistantBuilder {
        AssistantBuilder::new()
    }

    /// Build from a loaded configuration with the providers it lists.
    pub fn from_config(config: crate::config::Config) -> Result<Self> {
        AssistantBuilder::new().config(config).build()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn executor(&self) -> &Arc<BoundedExecutor> {
        &self.executor
    }

    /// Answer `prompt`, from cache when possible.
    pub async fn ask(
        &self,
        prompt: &str,
        task_type: TaskType,
        category: Category,
    ) -> Result<AskResponse> {
        self.ask_request(RoutingRequest::new(prompt, task_type, category))
            .await
    }

    /// [`ask`](Self::ask) with a caller-supplied request (and cancellation token).
    #[instrument(skip(self, request), fields(task = ?request.task_type, category = %request.category))]
    pub async fn ask_request(&self, request: RoutingRequest) -> Result<AskResponse> {
        let timer = StreamTimer::start(self.latencies.clone());

        if let Some(hit) = self.cache.lookup(&request.prompt, request.category).await {
            debug!(tier = ?hit.tier, "answered from cache");
            let sentences =
                self.spawn_pipeline(single_chunk(hit.value), request.cancel.clone(), None, None);
            return Ok(AskResponse {
                sentences,
                cache_hit: true,
                tier: hit.tier,
                stale: false,
                fallback: false,
                provider: None,
                cancel: request.cancel,
            });
        }

        match self.router.route(&request).await {
            Ok(stream) => {
                let provider = stream.provider().to_owned();
                let write_back = self
                    .cache
                    .is_cacheable(request.category)
                    .then(|| (request.prompt.clone(), request.category));
                let sentences = self.spawn_pipeline(
                    Box::pin(stream),
                    request.cancel.clone(),
                    Some(timer),
                    write_back,
                );
                Ok(AskResponse {
                    sentences,
                    cache_hit: false,
                    tier: None,
                    stale: false,
                    fallback: false,
                    provider: Some(provider),
                    cancel: request.cancel,
                })
            }
            Err(SwitchboardError::AllProvidersUnavailable { attempts }) => {
                self.degrade(request, attempts).await
            }
            Err(e) => Err(e),
        }
    }

    /// Answer from a stale entry or the canned response, or give up.
    async fn degrade(&self, request: RoutingRequest, attempts: usize) -> Result<AskResponse> {
        if self.capabilities.persistent_cache
            && let Some(stale) = self.cache.get_stale(&request.prompt, request.category).await
        {
            warn!(attempts, "no provider available; serving stale cache entry");
            let sentences =
                self.spawn_pipeline(single_chunk(stale.value), request.cancel.clone(), None, None);
            return Ok(AskResponse {
                sentences,
                cache_hit: false,
                tier: stale.tier,
                stale: true,
                fallback: false,
                provider: None,
                cancel: request.cancel,
            });
        }

        if let Some(canned) = &self.fallback_response {
            warn!(attempts, "no provider available; serving canned fallback");
            let sentences =
                self.spawn_pipeline(single_chunk(canned.clone()), request.cancel.clone(), None, None);
            return Ok(AskResponse {
                sentences,
                cache_hit: false,
                tier: None,
                stale: false,
                fallback: true,
                provider: None,
                cancel: request.cancel,
            });
        }

        Err(SwitchboardError::AllProvidersUnavailable { attempts })
    }

    /// Answer `prompt` and return the whole text at once.
    pub async fn ask_text(
        &self,
        prompt: &str,
        task_type: TaskType,
        category: Category,
    ) -> Result<String> {
        self.ask(prompt, task_type, category).await?.text().await
    }

    /// Segment `tokens` on a background task and feed sentences into a
    /// bounded channel. The full text is written to the cache only if the
    /// stream completed without error or cancellation.
    ///
    /// Only provider answers carry a `timer`; cached and fallback answers
    /// would skew the latency percentiles.
    fn spawn_pipeline(
        &self,
        mut tokens: TokenStream,
        cancel: CancellationToken,
        mut timer: Option<StreamTimer>,
        write_back: Option<(String, Category)>,
    ) -> SentenceStream {
        let (tx, rx) = mpsc::channel::<Result<String>>(self.sentence_buffer);
        let segmenter = Segmenter::with_cancel(self.min_sentence_chars, cancel.clone());
        let cache = self.cache.clone();

        tokio::spawn(async move {
            let mut full = String::new();
            let mut failed = false;

            while let Some(item) = tokens.next().await {
                match item {
                    Ok(chunk) => {
                        full.push_str(&chunk);
                        for sentence in segmenter.feed(&chunk) {
                            if !deliver(&tx, &cancel, Ok(sentence)).await {
                                return;
                            }
                            if let Some(timer) = timer.as_mut() {
                                timer.sentence_emitted();
                            }
                        }
                    }
                    Err(e) => {
                        if !e.is_cancellation() {
                            debug!(error = %e, "stream ended with an error");
                        }
                        failed = true;
                        let _ = deliver(&tx, &cancel, Err(e)).await;
                        break;
                    }
                }
            }

            if failed || cancel.is_cancelled() {
                segmenter.cancel();
                return;
            }
            if let Some(rest) = segmenter.finish() {
                if !deliver(&tx, &cancel, Ok(rest)).await {
                    return;
                }
                if let Some(timer) = timer.as_mut() {
                    timer.sentence_emitted();
                }
            }
            if let Some(timer) = timer {
                timer.completed();
            }

            if let Some((query, category)) = write_back
                && !cancel.is_cancelled()
                && !full.trim().is_empty()
            {
                cache.put(&query, category, &full).await;
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    /// Register a warm-up callback for `category`.
    ///
    /// The callback returns `(query, value)` pairs that [`prefetch`](Self::prefetch)
    /// writes to the cache. Failures are logged and swallowed.
    pub fn register_prefetch_hint<F, Fut>(&self, category: Category, hint: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<(String, String)>>> + Send + 'static,
    {
        let hint: PrefetchHint = Arc::new(move || hint().boxed());
        self.hints
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(category)
            .or_default()
            .push(hint);
    }

    /// Run every hint registered for `category` through the executor.
    ///
    /// Returns the number of entries written. Never fails.
    pub async fn prefetch(&self, category: Category) -> usize {
        let hints: Vec<PrefetchHint> = self
            .hints
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&category)
            .cloned()
            .unwrap_or_default();
        if hints.is_empty() {
            return 0;
        }

        let runs = hints
            .into_iter()
            .map(|hint| self.executor.submit(hint()));
        let mut written = 0;
        for result in join_all(runs).await {
            match result.and_then(|pairs| pairs) {
                Ok(pairs) => {
                    for (query, value) in pairs {
                        self.cache.put(&query, category, &value).await;
                        written += 1;
                    }
                }
                Err(e) => debug!(category = %category, error = %e, "prefetch hint failed"),
            }
        }
        written
    }

    /// [`prefetch`](Self::prefetch) on a background task.
    pub fn spawn_prefetch(self: &Arc<Self>, category: Category) -> JoinHandle<usize> {
        let assistant = self.clone();
        tokio::spawn(async move { assistant.prefetch(category).await })
    }

    /// Probe every provider through the executor.
    pub async fn probe_providers(&self) -> Vec<ProbeOutcome> {
        self.router.probe_all(&self.executor).await
    }

    /// Start the cache sweeper and, if enabled, the resource monitor.
    ///
    /// The tasks stop on their own once the assistant is dropped.
    pub fn spawn_maintenance(
        &self,
        sweep_interval: std::time::Duration,
        monitor_interval: std::time::Duration,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.cache.spawn_sweeper(sweep_interval)];
        if let Some(monitor) = &self.monitor {
            tasks.push(monitor.spawn(monitor_interval));
        }
        info!(tasks = tasks.len(), "maintenance started");
        tasks
    }

    /// Snapshot of cache, provider, streaming and resource state.
    pub fn metrics(&self) -> MetricsSnapshot {
        let resources = match &self.monitor {
            Some(monitor) => monitor.usage(),
            None => ResourceUsage {
                throttled: self.executor.is_throttled(),
                withheld_permits: self.executor.withheld_permits(),
                in_flight_tasks: self.executor.in_flight(),
                max_concurrent_tasks: self.executor.max_concurrent(),
                ..ResourceUsage::default()
            },
        };
        MetricsSnapshot {
            cache: self.cache.stats(),
            providers: self.router.tracker().snapshot(),
            streaming: self.latencies.snapshot(),
            resources,
        }
    }
}

/// Send one item unless the request was cancelled or the consumer left.
/// A departed consumer cancels the request.
async fn deliver(
    tx: &mpsc::Sender<Result<String>>,
    cancel: &CancellationToken,
    item: Result<String>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => {
            if sent.is_err() {
                cancel.cancel();
                return false;
            }
            true
        }
    }
}

fn single_chunk(value: String) -> TokenStream {
    Box::pin(futures_util::stream::once(async move { Ok(value) }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::stream;

    use super::*;
    use crate::cache::PersistentTier;
    use crate::clock::{ManualClock, SharedClock};
    use crate::config::Config;
    use crate::providers::{ModelProvider, ProviderDescriptor};

    struct Echo {
        calls: AtomicUsize,
        tokens: Vec<&'static str>,
    }

    #[async_trait]
    impl ModelProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn send(&self, _prompt: &str, _cancel: &CancellationToken) -> Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items: Vec<Result<String>> =
                self.tokens.iter().map(|t| Ok(t.to_string())).collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    struct Down;

    #[async_trait]
    impl ModelProvider for Down {
        fn name(&self) -> &str {
            "down"
        }

        async fn send(&self, _prompt: &str, _cancel: &CancellationToken) -> Result<TokenStream> {
            Err(SwitchboardError::ProviderServerError {
                provider: "down".into(),
                status: 503,
                message: "unavailable".into(),
            })
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(1_700_000_000_000))
    }

    fn assistant(provider: Arc<dyn ModelProvider>, clock: SharedClock) -> Assistant {
        let mut config = Config::default();
        config.streaming.min_sentence_chars = 1;
        let descriptor = ProviderDescriptor::new(provider.name());
        Assistant::builder()
            .config(config)
            .clock(clock.clone())
            .persistent_tier(PersistentTier::in_memory(clock).unwrap())
            .without_resource_monitor()
            .provider(provider, descriptor)
            .build()
            .unwrap()
    }

    async fn settle(assistant: &Assistant, query: &str, category: Category) {
        for _ in 0..50 {
            if assistant.cache().lookup(query, category).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn second_ask_is_served_from_cache() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            tokens: vec!["Sunny. ", "Light wind."],
        });
        let assistant = assistant(echo.clone(), clock());

        let first = assistant
            .ask("weather in Paris", TaskType::Default, Category::Weather)
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.provider.as_deref(), Some("echo"));
        assert_eq!(first.text().await.unwrap(), "Sunny. Light wind.");
        settle(&assistant, "weather in Paris", Category::Weather).await;

        let second = assistant
            .ask("Weather in  Paris?", TaskType::Default, Category::Weather)
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.text().await.unwrap(), "Sunny. Light wind.");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conversational_answers_are_not_cached() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            tokens: vec!["Hello there."],
        });
        let assistant = assistant(echo.clone(), clock());
        for _ in 0..2 {
            let text = assistant
                .ask_text("hi", TaskType::Default, Category::Conversational)
                .await
                .unwrap();
            assert_eq!(text, "Hello there.");
        }
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn outage_serves_stale_then_canned() {
        let clock = clock();
        let shared: SharedClock = clock.clone();
        let mut config = Config::default();
        config.router.fallback_response = Some("Sorry, try again later.".into());
        let assistant = Assistant::builder()
            .config(config)
            .clock(shared.clone())
            .persistent_tier(PersistentTier::in_memory(shared).unwrap())
            .without_resource_monitor()
            .provider(Arc::new(Down), ProviderDescriptor::new("down"))
            .build()
            .unwrap();
        assert!(assistant.capabilities().canned_fallback);

        assistant
            .cache()
            .put("news today", Category::News, "Old headline.")
            .await;
        clock.advance(Duration::from_secs(2 * 60 * 60));

        let stale = assistant
            .ask("news today", TaskType::Default, Category::News)
            .await
            .unwrap();
        assert!(stale.stale);
        assert!(!stale.cache_hit);
        assert_eq!(stale.text().await.unwrap(), "Old headline.");

        let canned = assistant
            .ask("unknown", TaskType::Default, Category::News)
            .await
            .unwrap();
        assert!(canned.fallback);
        assert_eq!(canned.text().await.unwrap(), "Sorry, try again later.");

        let latency = assistant.metrics().streaming;
        assert_eq!(latency.first_sentence.samples, 0);
        assert_eq!(latency.completion.samples, 0);
    }

    #[tokio::test]
    async fn prefetch_errors_are_swallowed() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            tokens: vec!["x"],
        });
        let assistant = assistant(echo.clone(), clock());
        assistant.register_prefetch_hint(Category::Weather, || async {
            Ok(vec![("weather in Oslo".to_string(), "Snow.".to_string())])
        });
        assistant.register_prefetch_hint(Category::Weather, || async {
            Err(SwitchboardError::Http("offline".into()))
        });

        assert_eq!(assistant.prefetch(Category::Weather).await, 1);
        assert_eq!(assistant.prefetch(Category::News).await, 0);

        let answer = assistant
            .ask("weather in oslo", TaskType::Fast, Category::Weather)
            .await
            .unwrap();
        assert!(answer.cache_hit);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn metrics_snapshot_reflects_activity() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            tokens: vec!["One. ", "Two."],
        });
        let assistant = assistant(echo, clock());
        assistant
            .ask_text("q", TaskType::Default, Category::General)
            .await
            .unwrap();

        let snapshot = assistant.metrics();
        assert_eq!(snapshot.cache.memory.misses, 1);
        assert_eq!(snapshot.providers.len(), 1);
        assert_eq!(snapshot.providers[0].total_dispatched, 1);
        assert_eq!(snapshot.streaming.first_sentence.samples, 1);
        assert_eq!(snapshot.resources.max_concurrent_tasks, 8);
    }

    #[tokio::test]
    async fn cache_hits_are_not_timed() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            tokens: vec!["Lima is the capital."],
        });
        let assistant = assistant(echo, clock());
        assistant
            .ask_text("capital of Peru", TaskType::Default, Category::StaticKnowledge)
            .await
            .unwrap();
        settle(&assistant, "capital of Peru", Category::StaticKnowledge).await;

        for _ in 0..3 {
            let hit = assistant
                .ask("capital of Peru", TaskType::Default, Category::StaticKnowledge)
                .await
                .unwrap();
            assert!(hit.cache_hit);
            hit.text().await.unwrap();
        }

        let latency = assistant.metrics().streaming;
        assert_eq!(latency.first_sentence.samples, 1);
        assert_eq!(latency.completion.samples, 1);
    }
}
