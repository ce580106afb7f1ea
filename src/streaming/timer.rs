//! Latency bookkeeping for streamed responses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::telemetry::{self, LatencyPercentiles, LatencyWindow};

/// Recent streaming latencies, shared by every request.
#[derive(Debug, Default)]
pub struct StreamLatencies {
    first_sentence: LatencyWindow,
    completion: LatencyWindow,
}

/// Percentiles for the metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StreamingLatency {
    /// Request start to first emitted sentence.
    pub first_sentence: LatencyPercentiles,
    /// Request start to end of stream.
    pub completion: LatencyPercentiles,
}

impl StreamLatencies {
    pub fn new(samples: usize) -> Self {
        Self {
            first_sentence: LatencyWindow::new(samples),
            completion: LatencyWindow::new(samples),
        }
    }

    pub fn snapshot(&self) -> StreamingLatency {
        StreamingLatency {
            first_sentence: self.first_sentence.percentiles(),
            completion: self.completion.percentiles(),
        }
    }
}

/// Times one request from start to first sentence and to completion.
#[derive(Debug)]
pub struct StreamTimer {
    started: Instant,
    first_sentence: Option<Duration>,
    latencies: Arc<StreamLatencies>,
}

impl StreamTimer {
    /// Start timing now.
    pub fn start(latencies: Arc<StreamLatencies>) -> Self {
        Self {
            started: Instant::now(),
            first_sentence: None,
            latencies,
        }
    }

    /// Record that a sentence went downstream. Only the first call counts.
    pub fn sentence_emitted(&mut self) {
        if self.first_sentence.is_some() {
            return;
        }
        let elapsed = self.started.elapsed();
        self.first_sentence = Some(elapsed);
        self.latencies.first_sentence.record(elapsed);
        metrics::histogram!(telemetry::TIME_TO_FIRST_SENTENCE_SECONDS)
            .record(elapsed.as_secs_f64());
    }

    /// Record that the stream ended normally.
    pub fn completed(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.latencies.completion.record(elapsed);
        metrics::histogram!(telemetry::STREAM_COMPLETION_SECONDS).record(elapsed.as_secs_f64());
        elapsed
    }

    /// Time to the first sentence, once one was emitted.
    pub fn first_sentence(&self) -> Option<Duration> {
        self.first_sentence
    }
}
