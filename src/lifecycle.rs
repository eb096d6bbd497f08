//! `Active -> ShuttingDown -> Closed` state machine, idempotent via compare-and-swap, plus the
//! idle-activity monitor.
//!
//! Structured like [`crate::circuit_breaker`]: an atomic state byte, CAS-guarded transitions, and
//! a state-change callback. The actual 8-step shutdown orchestration (stop ticker, drain pending,
//! signal drain, wait, cancel, wait again, close) lives in the client facade, which owns the
//! event queue and batch processor this manager coordinates; `LifecycleManager` itself only owns
//! the state and the idle-warning timer.

use crate::clock::{Clock, MonotonicClock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_ACTIVE: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    ShuttingDown,
    Closed,
}

fn state_from_code(code: u8) -> LifecycleState {
    match code {
        STATE_SHUTTING_DOWN => LifecycleState::ShuttingDown,
        STATE_CLOSED => LifecycleState::Closed,
        _ => LifecycleState::Active,
    }
}

pub struct LifecycleManager {
    state: AtomicU8,
    last_activity_millis: AtomicU64,
    started_at_millis: u64,
    clock: Arc<dyn Clock>,
    idle_warning_duration: Option<Duration>,
    idle_warned: AtomicBool,
    on_state_change: Arc<dyn Fn(LifecycleState, LifecycleState) + Send + Sync>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis();
        Self {
            state: AtomicU8::new(STATE_ACTIVE),
            last_activity_millis: AtomicU64::new(now),
            started_at_millis: now,
            clock,
            idle_warning_duration: None,
            idle_warned: AtomicBool::new(false),
            on_state_change: Arc::new(|_, _| {}),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let now = clock.now_millis();
        self.started_at_millis = now;
        self.last_activity_millis.store(now, Ordering::Release);
        self.clock = clock;
        self
    }

    pub fn with_idle_warning(mut self, duration: Duration) -> Self {
        self.idle_warning_duration = Some(duration);
        self
    }

    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(LifecycleState, LifecycleState) + Send + Sync + 'static,
    {
        self.on_state_change = Arc::new(callback);
        self
    }

    pub fn state(&self) -> LifecycleState {
        state_from_code(self.state.load(Ordering::Acquire))
    }

    pub fn uptime(&self) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(self.started_at_millis))
    }

    /// Call on every successful `enqueue`; does not reset the once-per-lifecycle idle warning.
    pub fn record_activity(&self) {
        self.last_activity_millis.store(self.clock.now_millis(), Ordering::Release);
    }

    /// Step 1 of shutdown: idempotent `Active -> ShuttingDown`. Returns `true` only for the call
    /// that actually performed the transition; a second caller gets `false` and should surface
    /// `IngestError::ClientClosed`.
    pub fn try_begin_shutdown(&self) -> bool {
        let ok = self
            .state
            .compare_exchange(STATE_ACTIVE, STATE_SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            (self.on_state_change)(LifecycleState::Active, LifecycleState::ShuttingDown);
        }
        ok
    }

    /// Step 8: final transition, always safe to call more than once.
    pub fn mark_closed(&self) {
        let previous = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if previous != STATE_CLOSED {
            (self.on_state_change)(state_from_code(previous), LifecycleState::Closed);
        }
    }

    /// Returns `true` exactly once per lifecycle, the first time this is polled after the idle
    /// threshold has elapsed with no intervening activity while still `Active`.
    pub fn check_idle_warning(&self) -> bool {
        let Some(threshold) = self.idle_warning_duration else { return false };
        if self.state() != LifecycleState::Active {
            return false;
        }
        if self.idle_warned.load(Ordering::Acquire) {
            return false;
        }
        let now = self.clock.now_millis();
        let last = self.last_activity_millis.load(Ordering::Acquire);
        if now.saturating_sub(last) > threshold.as_millis() as u64 {
            self.idle_warned.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Polls [`Self::check_idle_warning`] at `poll_interval` until it fires once or the
    /// lifecycle leaves `Active`, invoking `on_warning` on the single fire.
    pub fn spawn_idle_monitor(
        self: &Arc<Self>,
        poll_interval: Duration,
        on_warning: impl Fn() + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if manager.state() != LifecycleState::Active {
                    return;
                }
                if manager.check_idle_warning() {
                    on_warning();
                    return;
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}
