//! Streaming backpressure via bounded channels.
//!
//! Wraps a provider's token stream in a bounded `tokio::sync::mpsc::channel`
//! so that the producer waits when the consumer falls behind. Without this,
//! a fast provider can fill unbounded memory while the segmenter (or a slow
//! speech/UI consumer behind it) catches up.
//!
//! The producer task also watches the request's cancellation token: once it
//! fires, the upstream stream is dropped (closing the provider connection)
//! and the channel closes.

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::types::TokenStream;

/// Default number of tokens buffered between producer and consumer.
///
/// 64 keeps the consumer busy without letting a runaway provider buffer a
/// whole response in memory.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Wrap a token stream in a bounded channel for backpressure.
///
/// Spawns a producer task that reads from `inner` and sends items through a
/// bounded `mpsc` channel. The producer stops when the consumer drops the
/// stream or `cancel` fires, whichever comes first.
///
/// # Panics
///
/// Requires a tokio runtime context (called within an async fn).
pub fn bounded_stream(
    inner: TokenStream,
    buffer_size: usize,
    cancel: CancellationToken,
) -> TokenStream {
    let (tx, rx) = tokio::sync::mpsc::channel(buffer_size.max(1));

    tokio::spawn(async move {
        let mut inner = inner;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break, // receiver dropped while upstream idles
                item = inner.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        break; // receiver dropped
                    }
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::stream;

    use super::*;
    use crate::Result;

    fn counting_stream(n: usize, produced: Arc<AtomicUsize>) -> TokenStream {
        Box::pin(stream::iter(0..n).map(move |i| {
            produced.fetch_add(1, Ordering::SeqCst);
            Ok::<_, crate::SwitchboardError>(format!("t{i} "))
        }))
    }

    #[tokio::test]
    async fn passes_items_in_order() {
        let produced = Arc::new(AtomicUsize::new(0));
        let out: Vec<Result<String>> = bounded_stream(
            counting_stream(5, produced),
            2,
            CancellationToken::new(),
        )
        .collect()
        .await;
        let out: Vec<String> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, ["t0 ", "t1 ", "t2 ", "t3 ", "t4 "]);
    }

    #[tokio::test]
    async fn slow_consumer_holds_back_producer() {
        let produced = Arc::new(AtomicUsize::new(0));
        let mut out = bounded_stream(
            counting_stream(100, produced.clone()),
            4,
            CancellationToken::new(),
        );
        assert!(out.next().await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        // One consumed, four buffered, at most one more in flight.
        assert!(produced.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test]
    async fn cancellation_closes_stream() {
        let cancel = CancellationToken::new();
        let pending: TokenStream = Box::pin(stream::pending());
        let mut out = bounded_stream(pending, 4, cancel.clone());
        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), out.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
