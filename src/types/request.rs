//! Per-call routing request.

use tokio_util::sync::CancellationToken;

use super::{Category, TaskType};

/// A single request flowing through the router.
///
/// Created per call and dropped after completion or cancellation; never
/// persisted. The `cancel` token is shared with the provider call, the
/// segmenter and any executor task working on this request.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    /// User prompt sent to the provider.
    pub prompt: String,
    /// Task classification used for provider selection.
    pub task_type: TaskType,
    /// Cache classification.
    pub category: Category,
    /// Cooperative cancellation signal.
    pub cancel: CancellationToken,
}

impl RoutingRequest {
    /// Create a request with a fresh cancellation token.
    pub fn new(prompt: impl Into<String>, task_type: TaskType, category: Category) -> Self {
        Self {
            prompt: prompt.into(),
            task_type,
            category,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an existing cancellation token (e.g. a child of a session token).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether the caller has cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
