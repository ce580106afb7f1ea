//! Periodic memory sampling with hysteresis.
//!
//! Each sample compares resident memory against two watermarks:
//!
//! - rising above `high` fires the compaction hint once and withholds
//!   executor permits
//! - the executor stays throttled until memory falls below `low`, which
//!   restores every permit
//!
//! Between the two watermarks nothing changes, so a process hovering around
//! one threshold does not flap between states.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::BoundedExecutor;
use crate::cache::Cache;
use crate::config::ExecutorConfig;
use crate::telemetry;

const MIB: u64 = 1024 * 1024;

/// Source of the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in bytes, or `None` if it cannot be read.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads the current process's RSS through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|process| process.memory())
    }
}

/// Something that can release memory on request.
#[async_trait]
pub trait CompactionHint: Send + Sync {
    async fn compact(&self);
}

#[async_trait]
impl CompactionHint for Cache {
    async fn compact(&self) {
        Cache::compact(self).await;
    }
}

/// Latest resource sample, as reported by `Assistant::metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    /// Resident memory at the last sample, in bytes (0 before the first).
    pub resident_bytes: u64,
    pub high_watermark_bytes: u64,
    pub low_watermark_bytes: u64,
    /// Whether executor permits are currently withheld.
    pub throttled: bool,
    pub withheld_permits: usize,
    pub in_flight_tasks: usize,
    pub max_concurrent_tasks: usize,
}

/// Samples memory and applies backpressure to a [`BoundedExecutor`].
pub struct ResourceMonitor {
    probe: Arc<dyn MemoryProbe>,
    executor: Arc<BoundedExecutor>,
    compaction: Option<Arc<dyn CompactionHint>>,
    high_bytes: u64,
    low_bytes: u64,
    throttle_permits: usize,
    last_sample: AtomicU64,
    pressured: AtomicBool,
}

impl ResourceMonitor {
    /// Monitor using the process RSS and the watermarks from `config`.
    pub fn new(executor: Arc<BoundedExecutor>, config: &ExecutorConfig) -> Self {
        Self::with_probe(executor, config, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(
        executor: Arc<BoundedExecutor>,
        config: &ExecutorConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            probe,
            executor,
            compaction: None,
            high_bytes: config.memory_high_watermark_mb.saturating_mul(MIB),
            low_bytes: config.memory_low_watermark_mb.saturating_mul(MIB),
            throttle_permits: config.effective_throttle_permits(),
            last_sample: AtomicU64::new(0),
            pressured: AtomicBool::new(false),
        }
    }

    /// Call `hint` each time memory crosses the high watermark.
    pub fn with_compaction(mut self, hint: Arc<dyn CompactionHint>) -> Self {
        self.compaction = Some(hint);
        self
    }

    /// Take one sample and react to it.
    pub async fn sample_once(&self) -> ResourceUsage {
        let Some(resident) = self.probe.resident_bytes() else {
            warn!("resident memory unavailable; skipping sample");
            return self.usage();
        };
        self.last_sample.store(resident, Ordering::Release);
        metrics::gauge!(telemetry::PROCESS_MEMORY_BYTES).set(resident as f64);

        let pressured = self.pressured.load(Ordering::Acquire);
        if resident >= self.high_bytes {
            if !pressured {
                self.pressured.store(true, Ordering::Release);
                metrics::counter!(telemetry::THROTTLE_EVENTS_TOTAL).increment(1);
                warn!(
                    resident_mb = resident / MIB,
                    high_mb = self.high_bytes / MIB,
                    "memory above high watermark; throttling"
                );
                if let Some(hint) = &self.compaction {
                    hint.compact().await;
                }
            }
            // Tops up permits that were busy on the previous sample.
            self.executor.throttle(self.throttle_permits);
        } else if pressured && resident < self.low_bytes {
            self.pressured.store(false, Ordering::Release);
            let restored = self.executor.restore();
            info!(
                resident_mb = resident / MIB,
                restored, "memory below low watermark; throttle lifted"
            );
        } else if pressured {
            self.executor.throttle(self.throttle_permits);
        }
        self.usage()
    }

    /// Current view without sampling.
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            resident_bytes: self.last_sample.load(Ordering::Acquire),
            high_watermark_bytes: self.high_bytes,
            low_watermark_bytes: self.low_bytes,
            throttled: self.executor.is_throttled(),
            withheld_permits: self.executor.withheld_permits(),
            in_flight_tasks: self.executor.in_flight(),
            max_concurrent_tasks: self.executor.max_concurrent(),
        }
    }

    /// Sample every `interval` until the monitor is dropped.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.sample_once().await;
            }
        })
    }
}
