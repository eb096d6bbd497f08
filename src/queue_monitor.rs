//! Queue fill-level observation and backpressure decisioning.
//!
//! Structured like [`crate::circuit_breaker`]: atomic counters for the hot path, a small state
//! transition guarded by a compare-exchange, and a callback slot fired once per transition.

use crate::ingest_error::IngestError;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const LEVEL_NONE: u8 = 0;
const LEVEL_WARNING: u8 = 1;
const LEVEL_CRITICAL: u8 = 2;
const LEVEL_OVERFLOW: u8 = 3;

/// Queue fill-level band, reported as a percentage of capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueLevel {
    None,
    Warning,
    Critical,
    Overflow,
}

impl QueueLevel {
    fn from_code(code: u8) -> Self {
        match code {
            LEVEL_WARNING => QueueLevel::Warning,
            LEVEL_CRITICAL => QueueLevel::Critical,
            LEVEL_OVERFLOW => QueueLevel::Overflow,
            _ => QueueLevel::None,
        }
    }

    fn code(self) -> u8 {
        match self {
            QueueLevel::None => LEVEL_NONE,
            QueueLevel::Warning => LEVEL_WARNING,
            QueueLevel::Critical => LEVEL_CRITICAL,
            QueueLevel::Overflow => LEVEL_OVERFLOW,
        }
    }
}

/// Percent-full thresholds that separate the four [`QueueLevel`] bands.
#[derive(Debug, Clone, Copy)]
pub struct QueueMonitorConfig {
    pub warning_pct: f64,
    pub critical_pct: f64,
    pub overflow_pct: f64,
}

impl Default for QueueMonitorConfig {
    fn default() -> Self {
        Self { warning_pct: 0.50, critical_pct: 0.70, overflow_pct: 0.90 }
    }
}

/// Tracks queue depth against `capacity` and fires `on_transition` once per level change.
pub struct QueueMonitor {
    capacity: usize,
    config: QueueMonitorConfig,
    current_level: AtomicU8,
    on_transition: Arc<dyn Fn(QueueLevel, QueueLevel) + Send + Sync>,
}

impl std::fmt::Debug for QueueMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMonitor")
            .field("capacity", &self.capacity)
            .field("current_level", &self.level())
            .finish()
    }
}

impl QueueMonitor {
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, QueueMonitorConfig::default())
    }

    pub fn with_config(capacity: usize, config: QueueMonitorConfig) -> Self {
        Self { capacity, config, current_level: AtomicU8::new(LEVEL_NONE), on_transition: Arc::new(|_, _| {}) }
    }

    pub fn on_transition<F>(mut self, callback: F) -> Self
    where
        F: Fn(QueueLevel, QueueLevel) + Send + Sync + 'static,
    {
        self.on_transition = Arc::new(callback);
        self
    }

    fn level_for(&self, depth: usize) -> QueueLevel {
        if self.capacity == 0 {
            return QueueLevel::Overflow;
        }
        let pct = depth as f64 / self.capacity as f64;
        if pct >= self.config.overflow_pct {
            QueueLevel::Overflow
        } else if pct >= self.config.critical_pct {
            QueueLevel::Critical
        } else if pct >= self.config.warning_pct {
            QueueLevel::Warning
        } else {
            QueueLevel::None
        }
    }

    /// Current cached level without recomputing from a depth sample.
    pub fn level(&self) -> QueueLevel {
        QueueLevel::from_code(self.current_level.load(Ordering::Acquire))
    }

    /// Record a new depth sample, updating the cached level and firing the callback exactly once
    /// if the level changed.
    pub fn observe(&self, depth: usize) -> QueueLevel {
        let new_level = self.level_for(depth);
        let previous_code = self.current_level.swap(new_level.code(), Ordering::AcqRel);
        let previous = QueueLevel::from_code(previous_code);
        if previous != new_level {
            (self.on_transition)(previous, new_level);
        }
        new_level
    }
}

/// How the handler reacts when the queue is at [`QueueLevel::Overflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Allow the event through anyway (best-effort).
    #[default]
    Allow,
    /// Poll until the level drops below `Overflow` or the deadline elapses.
    Block { poll_interval: PollInterval },
    /// Silently discard the event and increment the dropped counter.
    Drop,
}

/// Newtype so `OverflowPolicy` can derive `PartialEq`/`Eq` over a `Duration`-shaped field without
/// requiring callers to import `std::time::Duration` just to match on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval(pub Duration);

impl Default for PollInterval {
    fn default() -> Self {
        Self(Duration::from_millis(10))
    }
}

/// Maps queue level + policy to an admission decision, per the spec's level/policy table.
pub struct BackpressureHandler {
    monitor: QueueMonitor,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl std::fmt::Debug for BackpressureHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureHandler")
            .field("policy", &self.policy)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl BackpressureHandler {
    pub fn new(monitor: QueueMonitor, policy: OverflowPolicy) -> Self {
        Self { monitor, policy, dropped: AtomicU64::new(0) }
    }

    pub fn monitor(&self) -> &QueueMonitor {
        &self.monitor
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Admit a new event given the queue's current depth, sampled via `depth_fn` each poll tick.
    ///
    /// `None`/`Warning`/`Critical` always allow (Critical additionally logs a warning). Overflow
    /// defers to `policy`: `Allow` lets it through, `Drop` discards it and returns `Ok(())`
    /// without surfacing an error to the caller (the drop is silent per the spec), and `Block`
    /// polls until the level drops or `deadline` elapses, returning
    /// [`IngestError::Backpressure`] on timeout.
    pub async fn admit<F>(&self, depth_fn: F, deadline: Duration) -> Result<(), IngestError>
    where
        F: Fn() -> usize,
    {
        let level = self.monitor.observe(depth_fn());

        match level {
            QueueLevel::None | QueueLevel::Warning => Ok(()),
            QueueLevel::Critical => {
                tracing::warn!("queue at critical fill level");
                Ok(())
            }
            QueueLevel::Overflow => match self.policy {
                OverflowPolicy::Allow => Ok(()),
                OverflowPolicy::Drop => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                OverflowPolicy::Block { poll_interval } => {
                    let start = Instant::now();
                    loop {
                        if start.elapsed() >= deadline {
                            return Err(IngestError::Backpressure);
                        }
                        tokio::time::sleep(poll_interval.0).await;
                        if self.monitor.observe(depth_fn()) != QueueLevel::Overflow {
                            return Ok(());
                        }
                        if start.elapsed() >= deadline {
                            return Err(IngestError::Backpressure);
                        }
                    }
                }
            },
        }
    }
}
