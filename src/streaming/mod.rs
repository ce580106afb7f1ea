//! Incremental output: sentence segmentation and streaming latency.
//!
//! A [`Segmenter`] turns the provider's token stream into sentences that can
//! be pushed downstream (speech synthesis, chat bubbles) long before the full
//! response exists. A [`StreamTimer`] measures how long that took.

pub mod segmenter;
pub mod timer;

pub use segmenter::{DEFAULT_MIN_SENTENCE_CHARS, Segmenter};
pub use timer::{StreamLatencies, StreamTimer, StreamingLatency};
