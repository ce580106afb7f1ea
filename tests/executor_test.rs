//! Tests for bounded execution and memory-pressure throttling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use switchboard::config::ExecutorConfig;
use switchboard::{BoundedExecutor, CompactionHint, MemoryProbe, ResourceMonitor, SwitchboardError};

const MIB: u64 = 1024 * 1024;

async fn wait_for_in_flight(executor: &BoundedExecutor, n: usize) {
    while executor.in_flight() < n {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Bounded concurrency
// ============================================================================

#[tokio::test]
async fn extra_task_waits_until_a_permit_frees() {
    let executor = Arc::new(BoundedExecutor::new(2, Duration::from_secs(5)));
    let gate = CancellationToken::new();

    let holders: Vec<_> = (0..2)
        .map(|_| {
            let executor = executor.clone();
            let gate = gate.clone();
            tokio::spawn(async move { executor.submit(async move { gate.cancelled().await }).await })
        })
        .collect();
    wait_for_in_flight(&executor, 2).await;

    let started = Arc::new(AtomicBool::new(false));
    let third = {
        let executor = executor.clone();
        let started = started.clone();
        tokio::spawn(async move {
            executor
                .submit(async move { started.store(true, Ordering::SeqCst) })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!started.load(Ordering::SeqCst), "third task ran before a permit freed");
    assert_eq!(executor.available_permits(), 0);

    gate.cancel();
    third.await.unwrap().unwrap();
    assert!(started.load(Ordering::SeqCst));
    for holder in holders {
        holder.await.unwrap().unwrap();
    }
    assert_eq!(executor.available_permits(), 2);
}

#[tokio::test]
async fn waiting_submit_is_woken_when_a_permit_frees() {
    let executor = Arc::new(BoundedExecutor::new(1, Duration::from_secs(5)));
    let gate = CancellationToken::new();
    let holder = {
        let executor = executor.clone();
        let gate = gate.clone();
        tokio::spawn(async move { executor.submit(async move { gate.cancelled().await }).await })
    };
    wait_for_in_flight(&executor, 1).await;

    let mut waiting = tokio_test::task::spawn(executor.submit(async { 7 }));
    tokio_test::assert_pending!(waiting.poll());
    assert!(!waiting.is_woken());

    gate.cancel();
    holder.await.unwrap().unwrap();
    assert!(waiting.is_woken());
}

#[tokio::test(start_paused = true)]
async fn submit_times_out_when_saturated() {
    let executor = Arc::new(BoundedExecutor::new(1, Duration::from_secs(2)));
    let gate = CancellationToken::new();
    let holder = {
        let executor = executor.clone();
        let gate = gate.clone();
        tokio::spawn(async move { executor.submit(async move { gate.cancelled().await }).await })
    };
    wait_for_in_flight(&executor, 1).await;

    let err = executor.submit(async { 42 }).await.unwrap_err();
    match err {
        SwitchboardError::ExecutorSaturated { waited } => {
            assert_eq!(waited, Duration::from_secs(2))
        }
        other => panic!("expected saturation, got {other:?}"),
    }

    gate.cancel();
    holder.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn throttled_executor_runs_fewer_tasks_at_once() {
    let executor = Arc::new(BoundedExecutor::new(4, Duration::from_secs(5)));
    assert_eq!(executor.throttle(3), 3);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let executor = executor.clone();
            let running = running.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                executor
                    .submit(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    assert_eq!(executor.restore(), 3);
    assert_eq!(executor.available_permits(), 4);
}

// ============================================================================
// Resource monitor
// ============================================================================

struct ScriptedProbe(AtomicU64);

impl ScriptedProbe {
    fn set_mb(&self, mb: u64) {
        self.0.store(mb * MIB, Ordering::SeqCst);
    }
}

impl MemoryProbe for ScriptedProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct CountingCompaction(AtomicUsize);

#[async_trait]
impl CompactionHint for CountingCompaction {
    async fn compact(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn memory_pressure_throttles_then_recovers() {
    let config = ExecutorConfig {
        max_concurrent_tasks: 8,
        memory_high_watermark_mb: 512,
        memory_low_watermark_mb: 256,
        throttle_permits: Some(4),
        ..ExecutorConfig::default()
    };
    let executor = Arc::new(BoundedExecutor::from_config(&config));
    let probe = Arc::new(ScriptedProbe(AtomicU64::new(0)));
    let compaction = Arc::new(CountingCompaction::default());
    let monitor = ResourceMonitor::with_probe(executor.clone(), &config, probe.clone())
        .with_compaction(compaction.clone());

    probe.set_mb(100);
    assert!(!monitor.sample_once().await.throttled);

    probe.set_mb(600);
    let usage = monitor.sample_once().await;
    assert!(usage.throttled);
    assert_eq!(usage.withheld_permits, 4);
    assert_eq!(executor.available_permits(), 4);
    assert_eq!(compaction.0.load(Ordering::SeqCst), 1);

    // Between the watermarks: still throttled, no second compaction.
    probe.set_mb(400);
    assert!(monitor.sample_once().await.throttled);
    probe.set_mb(700);
    monitor.sample_once().await;
    assert_eq!(compaction.0.load(Ordering::SeqCst), 1);

    probe.set_mb(200);
    let usage = monitor.sample_once().await;
    assert!(!usage.throttled);
    assert_eq!(executor.available_permits(), 8);
    assert_eq!(usage.resident_bytes, 200 * MIB);
}
