//! Tests for sentence streaming and cancellation through the facade.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use switchboard::config::Config;
use switchboard::{
    Assistant, Category, ManualClock, ModelProvider, PersistentTier, ProviderDescriptor, Result,
    Segmenter, SharedClock, SwitchboardError, TaskType, TokenStream,
};

// ============================================================================
// Segmenter
// ============================================================================

/// Splits text the way chat-completion tokenizers tend to: short word pieces
/// with punctuation attached to whatever follows.
fn llm_tokens(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(3).map(|c| c.iter().collect()).collect()
}

#[test]
fn token_by_token_yields_exactly_two_sentences() {
    let text = "Dr. Smith earns $3.14 per unit. See https://a.b/c.d for details.";
    let segmenter = Segmenter::new(12);
    let mut sentences = Vec::new();
    for token in llm_tokens(text) {
        sentences.extend(segmenter.feed(&token));
    }
    sentences.extend(segmenter.finish());

    assert_eq!(
        sentences,
        [
            "Dr. Smith earns $3.14 per unit.",
            "See https://a.b/c.d for details."
        ]
    );
}

#[test]
fn first_sentence_is_available_before_the_rest_arrives() {
    let segmenter = Segmenter::new(12);
    let mut first_at = None;
    for (i, token) in llm_tokens("The forecast is sunny today. Expect a light breeze in the evening.")
        .into_iter()
        .enumerate()
    {
        if !segmenter.feed(&token).is_empty() && first_at.is_none() {
            first_at = Some(i);
        }
    }
    let first_at = first_at.unwrap();
    assert!(first_at < 12, "first sentence only after token {first_at}");
}

// ============================================================================
// Cancellation through the facade
// ============================================================================

/// Streams whatever the test pushes into its channel.
struct Remote {
    tokens: Mutex<Option<mpsc::UnboundedReceiver<Result<String>>>>,
}

#[async_trait]
impl ModelProvider for Remote {
    fn name(&self) -> &str {
        "remote"
    }

    async fn send(&self, _prompt: &str, _cancel: &CancellationToken) -> Result<TokenStream> {
        let rx = self.tokens.lock().unwrap().take().expect("single use");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

fn assistant(provider: Arc<Remote>) -> Assistant {
    let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000_000));
    Assistant::builder()
        .config(Config::default())
        .clock(clock.clone())
        .persistent_tier(PersistentTier::in_memory(clock).unwrap())
        .without_resource_monitor()
        .provider(provider, ProviderDescriptor::new("remote"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn cancelling_mid_stream_keeps_delivered_sentences_and_skips_cache() {
    let (tx, rx) = mpsc::unbounded_channel();
    let provider = Arc::new(Remote {
        tokens: Mutex::new(Some(rx)),
    });
    let assistant = assistant(provider);

    tx.send(Ok("The first sentence is here. ".to_string())).unwrap();
    let mut response = assistant
        .ask("tell me a story", TaskType::Default, Category::General)
        .await
        .unwrap();
    assert!(!response.cache_hit);

    let first = response.next().await.unwrap().unwrap();
    assert_eq!(first, "The first sentence is here.");
    assert_eq!(assistant.metrics().streaming.first_sentence.samples, 1);

    response.cancel();
    let _ = tx.send(Ok("A second sentence follows. And more".to_string()));
    drop(tx);

    let rest: Vec<Result<String>> = response.collect().await;
    assert!(rest.iter().all(|r| r.is_err()), "no sentences after cancel: {rest:?}");

    assert!(
        assistant
            .cache()
            .lookup("tell me a story", Category::General)
            .await
            .is_none()
    );
    let health = &assistant.metrics().providers[0];
    assert_eq!(health.total_failures, 0);
    assert_eq!(assistant.metrics().streaming.completion.samples, 0);
}

#[tokio::test(start_paused = true)]
async fn provider_stalling_mid_answer_ends_the_stream_with_a_timeout() {
    let (tx, rx) = mpsc::unbounded_channel();
    let provider = Arc::new(Remote {
        tokens: Mutex::new(Some(rx)),
    });
    let assistant = assistant(provider);

    tx.send(Ok("The first sentence is here. ".to_string())).unwrap();
    let mut response = assistant
        .ask("tell me a story", TaskType::Default, Category::General)
        .await
        .unwrap();
    assert_eq!(
        response.next().await.unwrap().unwrap(),
        "The first sentence is here."
    );

    // The sender stays open but nothing else arrives.
    let err = response.next().await.unwrap().unwrap_err();
    assert!(matches!(err, SwitchboardError::ProviderTimeout { .. }), "{err:?}");
    assert!(response.next().await.is_none());

    let health = &assistant.metrics().providers[0];
    assert_eq!(health.total_failures, 1);
    assert!(
        assistant
            .cache()
            .lookup("tell me a story", Category::General)
            .await
            .is_none()
    );
    drop(tx);
}

#[tokio::test]
async fn completed_stream_is_cached_as_full_text() {
    let (tx, rx) = mpsc::unbounded_channel();
    let provider = Arc::new(Remote {
        tokens: Mutex::new(Some(rx)),
    });
    let assistant = assistant(provider);

    for token in llm_tokens("Water boils at one hundred degrees. At sea level, that is.") {
        tx.send(Ok(token)).unwrap();
    }
    drop(tx);

    let response = assistant
        .ask("boiling point", TaskType::Default, Category::General)
        .await
        .unwrap();
    let sentences: Vec<String> = response.map(|s| s.unwrap()).collect().await;
    assert_eq!(
        sentences,
        ["Water boils at one hundred degrees.", "At sea level, that is."]
    );

    let cached = assistant
        .cache()
        .lookup("boiling point", Category::General)
        .await
        .unwrap();
    assert_eq!(
        cached.value,
        "Water boils at one hundred degrees. At sea level, that is."
    );
    assert_eq!(assistant.metrics().streaming.completion.samples, 1);
}

#[tokio::test]
async fn provider_error_mid_stream_is_surfaced_and_not_cached() {
    let (tx, rx) = mpsc::unbounded_channel();
    let provider = Arc::new(Remote {
        tokens: Mutex::new(Some(rx)),
    });
    let assistant = assistant(provider);

    tx.send(Ok("Partial answer that was fine. ".to_string())).unwrap();
    tx.send(Err(switchboard::SwitchboardError::Stream("connection reset".into())))
        .unwrap();
    drop(tx);

    let items: Vec<Result<String>> = assistant
        .ask("flaky", TaskType::Default, Category::General)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "Partial answer that was fine.");
    assert!(items[1].is_err());

    assert!(
        assistant
            .cache()
            .lookup("flaky", Category::General)
            .await
            .is_none()
    );
    assert_eq!(assistant.metrics().providers[0].total_failures, 1);
}
