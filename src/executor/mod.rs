//! Bounded task execution.
//!
//! [`BoundedExecutor`] gates work behind a fixed-size semaphore. `submit`
//! waits for a permit up to the configured submit timeout, then runs the
//! task on its own tokio task so a panic surfaces as
//! [`SwitchboardError::TaskPanicked`] instead of unwinding into the caller.
//! The permit is released when the task finishes, is cancelled or panics.
//!
//! The [`ResourceMonitor`] can shrink the effective permit count while the
//! process is under memory pressure (see [`BoundedExecutor::throttle`]).

pub mod monitor;

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::telemetry;
use crate::{Result, SwitchboardError};

pub use monitor::{CompactionHint, MemoryProbe, ResourceMonitor, ResourceUsage, SysinfoProbe};

/// Semaphore-gated executor.
#[derive(Debug)]
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    submit_timeout: Duration,
    /// Permits removed from circulation by `throttle`.
    withheld: Mutex<usize>,
    in_flight: Arc<AtomicUsize>,
}

impl BoundedExecutor {
    /// Executor running at most `max_concurrent` tasks (at least one).
    pub fn new(max_concurrent: usize, submit_timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            submit_timeout,
            withheld: Mutex::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.max_concurrent_tasks, config.submit_timeout())
    }

    /// Run `task` once a permit is available.
    ///
    /// Fails with [`SwitchboardError::ExecutorSaturated`] if no permit frees
    /// within the submit timeout. If the returned future is dropped after
    /// the task started, the task keeps its permit until it finishes; use
    /// [`submit_with_cancel`](Self::submit_with_cancel) to stop it early.
    pub async fn submit<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        self.spawn(permit, task).await
    }

    /// Like [`submit`](Self::submit), but `cancel` aborts both the wait for a
    /// permit and the running task with [`SwitchboardError::RequestCancelled`].
    pub async fn submit_with_cancel<F, T>(&self, cancel: CancellationToken, task: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SwitchboardError::RequestCancelled),
            permit = self.acquire() => permit?,
        };
        let guarded = async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                value = task => Some(value),
            }
        };
        self.spawn(permit, guarded)
            .await?
            .ok_or(SwitchboardError::RequestCancelled)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(self.submit_timeout, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(SwitchboardError::ExecutorSaturated {
                waited: Duration::ZERO,
            }),
            Err(_) => {
                metrics::counter!(telemetry::EXECUTOR_SATURATED_TOTAL).increment(1);
                warn!(
                    waited_ms = self.submit_timeout.as_millis() as u64,
                    in_flight = self.in_flight(),
                    "executor saturated"
                );
                Err(SwitchboardError::ExecutorSaturated {
                    waited: self.submit_timeout,
                })
            }
        }
    }

    async fn spawn<F, T>(&self, permit: OwnedSemaphorePermit, task: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = ExecutionSlot::enter(permit, self.in_flight.clone());
        let handle = tokio::spawn(async move {
            let _slot = slot;
            task.await
        });
        match handle.await {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!(panic = %message, "executor task panicked");
                Err(SwitchboardError::TaskPanicked(message))
            }
            Err(_) => Err(SwitchboardError::RequestCancelled),
        }
    }

    /// Withhold up to `permits` permits (never all of them).
    ///
    /// Only idle permits can be withheld; calling again after running tasks
    /// finish tops the withheld count up. Returns the total now withheld.
    pub fn throttle(&self, permits: usize) -> usize {
        let target = permits.min(self.max_concurrent - 1);
        let mut withheld = self.withheld.lock().unwrap_or_else(|p| p.into_inner());
        if target > *withheld {
            let forgotten = self.semaphore.forget_permits(target - *withheld);
            *withheld += forgotten;
            if forgotten > 0 {
                debug!(withheld = *withheld, "executor throttled");
            }
        }
        *withheld
    }

    /// Return every withheld permit.
    pub fn restore(&self) -> usize {
        let mut withheld = self.withheld.lock().unwrap_or_else(|p| p.into_inner());
        let restored = std::mem::take(&mut *withheld);
        if restored > 0 {
            self.semaphore.add_permits(restored);
            debug!(restored, "executor throttle lifted");
        }
        restored
    }

    pub fn is_throttled(&self) -> bool {
        *self.withheld.lock().unwrap_or_else(|p| p.into_inner()) > 0
    }

    pub fn withheld_permits(&self) -> usize {
        *self.withheld.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tasks currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// A held permit plus the in-flight count it contributes to.
struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl ExecutionSlot {
    fn enter(permit: OwnedSemaphorePermit, in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            _permit: permit,
            in_flight,
        }
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn runs_task_and_releases_permit() {
        let executor = BoundedExecutor::new(2, Duration::from_secs(1));
        let value = executor.submit(async { 21 * 2 }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(executor.available_permits(), 2);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn saturation_times_out_with_distinct_error() {
        let executor = Arc::new(BoundedExecutor::new(1, Duration::from_millis(50)));
        let (release, hold) = oneshot::channel::<()>();
        let busy = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.submit(async move { hold.await.ok() }).await })
        };
        while executor.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let err = executor.submit(async { 1 }).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::ExecutorSaturated { waited } if waited == Duration::from_millis(50)));

        release.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert_eq!(executor.submit(async { 1 }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn panic_is_reported_and_permit_returned() {
        let executor = BoundedExecutor::new(1, Duration::from_secs(1));
        let err = executor
            .submit(async {
                panic!("kaboom");
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::TaskPanicked(ref m) if m == "kaboom"));
        assert_eq!(executor.available_permits(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_running_task() {
        let executor = BoundedExecutor::new(1, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = executor
            .submit_with_cancel(cancel, std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(executor.available_permits(), 1);
    }

    #[tokio::test]
    async fn never_exceeds_permit_count() {
        let executor = Arc::new(BoundedExecutor::new(3, Duration::from_secs(5)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let executor = executor.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    executor
                        .submit(async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(executor.available_permits(), 3);
    }

    #[test]
    fn throttle_keeps_one_permit_and_restores() {
        let executor = BoundedExecutor::new(4, Duration::from_secs(1));
        assert_eq!(executor.throttle(10), 3);
        assert_eq!(executor.available_permits(), 1);
        assert!(executor.is_throttled());
        // Repeated throttling is idempotent.
        assert_eq!(executor.throttle(3), 3);
        assert_eq!(executor.restore(), 3);
        assert_eq!(executor.available_permits(), 4);
        assert!(!executor.is_throttled());
    }
}
