//! Circuit breaking
//!
//! One breaker per provider endpoint watches the failure ratio of recent
//! calls and stops traffic to a provider that keeps failing.
//!
//! ```text
//!            failures/total >= ratio
//!            (and total >= min_samples)
//!   CLOSED ────────────────────────────> OPEN
//!     ^                                 │  ^
//!     │ trial succeeds     break_time   │  │ trial fails
//!     │                    elapsed      v  │
//!     └──────────────────────────── HALF_OPEN
//! ```
//!
//! Calls are counted in a ring of fixed-length time slots. A call counts as
//! failed when it never completed, completed with an error, or took longer
//! than the slow-call threshold.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use caderpc_common::{CadeError, Endpoint, Result};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::outcome::CallOutcome;

/// Circuit breaker state for each endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Normal operation, requests flow through
    Closed,
    /// Circuit is tripped, requests fail fast without reaching the provider
    Open,
    /// One trial request is testing whether the provider recovered
    HalfOpen,
}

impl CircuitBreakerState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitBreakerState::Closed => 0,
            CircuitBreakerState::Open => 1,
            CircuitBreakerState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitBreakerState::Open,
            2 => CircuitBreakerState::HalfOpen,
            _ => CircuitBreakerState::Closed,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Span of recent calls the failure ratio is computed over
    pub window: Duration,
    /// Length of one counting slot; the ring holds `window / slot_interval + 1` slots
    pub slot_interval: Duration,
    /// Fewer calls than this in the window never trip the circuit
    pub min_samples: u32,
    /// Failure ratio at or above which the circuit trips
    pub fail_ratio: f64,
    /// How long the circuit stays open before admitting a trial call
    pub break_time: Duration,
    /// Calls slower than this count as failures
    pub slow_call_threshold: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            slot_interval: Duration::from_secs(5),
            min_samples: 10,
            fail_ratio: 0.5,
            break_time: Duration::from_secs(100),
            slow_call_threshold: Duration::from_secs(2),
        }
    }
}

impl BreakerConfig {
    pub fn with_window(mut self, window: Duration, slot_interval: Duration) -> Self {
        self.window = window;
        self.slot_interval = slot_interval;
        self
    }

    pub fn with_min_samples(mut self, min_samples: u32) -> Self {
        self.min_samples = min_samples;
        self
    }

    pub fn with_fail_ratio(mut self, fail_ratio: f64) -> Self {
        self.fail_ratio = fail_ratio;
        self
    }

    pub fn with_break_time(mut self, break_time: Duration) -> Self {
        self.break_time = break_time;
        self
    }

    pub fn with_slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_interval.as_millis() == 0 {
            return Err(CadeError::Config("breaker slot interval must be at least 1ms".into()));
        }
        if self.window < self.slot_interval {
            return Err(CadeError::Config(
                "breaker window must be at least one slot interval".into(),
            ));
        }
        if self.min_samples == 0 {
            return Err(CadeError::Config("breaker min_samples must be positive".into()));
        }
        if !(self.fail_ratio > 0.0 && self.fail_ratio <= 1.0) {
            return Err(CadeError::Config(format!(
                "breaker fail_ratio must be in (0, 1], got {}",
                self.fail_ratio
            )));
        }
        Ok(())
    }

    fn ring_size(&self) -> usize {
        (self.window.as_millis() / self.slot_interval.as_millis().max(1)) as usize + 1
    }
}

/// Admission gate in front of one endpoint.
pub trait CircuitBreaker: Send + Sync {
    /// Whether a call may go to the endpoint now.
    ///
    /// In the open state the first caller after the break time wins the
    /// half-open trial call and gets `true`; everyone else gets `false` until
    /// its outcome is recorded. A trial call that records nothing for another
    /// break time is replaced by the next caller.
    fn allow_request(&self) -> bool;

    /// Feeds one finished call into the breaker.
    fn record(&self, outcome: &CallOutcome);

    fn state(&self) -> CircuitBreakerState;
}

const EMPTY_SLOT: u64 = u64::MAX;

#[derive(Debug)]
struct Slot {
    epoch: u64,
    start_ms: u64,
    total: AtomicU32,
    failures: AtomicU32,
}

impl Slot {
    fn new(epoch: u64, start_ms: u64) -> Self {
        Self {
            epoch,
            start_ms,
            total: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }
}

/// Failure-ratio breaker over a sliding window of time slots.
///
/// The slot in use is named by `epoch`. Moving to a new slot is a
/// compare-and-swap on `epoch`; only the winner writes the fresh slot into
/// the ring, and losers wait until they can see it.
pub struct SlidingWindowBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    break_start_ms: AtomicU64,
    /// When the outstanding trial call was admitted.
    trial_since_ms: AtomicU64,
    /// Slots that started before this are ignored. Moves forward when a trial call closes the circuit.
    window_floor_ms: AtomicU64,
    epoch: AtomicU64,
    ring: Vec<RwLock<Arc<Slot>>>,
    origin: Instant,
}

impl SlidingWindowBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let ring = (0..config.ring_size())
            .map(|i| {
                let slot = if i == 0 { Slot::new(0, 0) } else { Slot::new(EMPTY_SLOT, 0) };
                RwLock::new(Arc::new(slot))
            })
            .collect();

        Self {
            config,
            state: AtomicU8::new(CircuitBreakerState::Closed.to_u8()),
            break_start_ms: AtomicU64::new(0),
            trial_since_ms: AtomicU64::new(0),
            window_floor_ms: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            ring,
            origin: Instant::now(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Calls and failures currently inside the window.
    pub fn window_counts(&self) -> (u64, u64) {
        self.counts_at(self.now_ms())
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn index(&self, epoch: u64) -> usize {
        (epoch % self.ring.len() as u64) as usize
    }

    /// Returns the slot to count into at `now`, starting a new one if the
    /// current slot is older than the slot interval (or, with `fresh`, if it
    /// started before `now`).
    fn slot_at(&self, now: u64, fresh: bool) -> Arc<Slot> {
        let interval = self.config.slot_interval.as_millis() as u64;
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            let slot = self.ring[self.index(epoch)].read().clone();
            if slot.epoch != epoch {
                // the CAS winner has not installed its slot yet
                std::hint::spin_loop();
                continue;
            }

            let reusable = if fresh {
                slot.start_ms >= now
            } else {
                now.saturating_sub(slot.start_ms) < interval
            };
            if reusable {
                return slot;
            }

            let next = epoch + 1;
            if self
                .epoch
                .compare_exchange(epoch, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let slot = Arc::new(Slot::new(next, now));
                *self.ring[self.index(next)].write() = slot.clone();
                return slot;
            }
        }
    }

    fn counts_at(&self, now: u64) -> (u64, u64) {
        let window = self.config.window.as_millis() as u64;
        let floor = now
            .saturating_sub(window)
            .max(self.window_floor_ms.load(Ordering::Acquire));

        self.ring
            .iter()
            .map(|cell| cell.read().clone())
            .filter(|slot| slot.epoch != EMPTY_SLOT && slot.start_ms >= floor)
            .fold((0, 0), |(total, failures), slot| {
                (
                    total + slot.total.load(Ordering::Acquire) as u64,
                    failures + slot.failures.load(Ordering::Acquire) as u64,
                )
            })
    }

    fn is_failure(&self, outcome: &CallOutcome) -> bool {
        !outcome.complete
            || outcome.error.is_some()
            || outcome.duration > self.config.slow_call_threshold
    }

    fn transition(&self, from: CircuitBreakerState, to: CircuitBreakerState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn trip(&self, from: CircuitBreakerState, now: u64) {
        self.break_start_ms.store(now, Ordering::Release);
        if self.transition(from, CircuitBreakerState::Open) {
            tracing::warn!(from = ?from, break_ms = self.config.break_time.as_millis() as u64, "circuit opened");
        }
    }

    fn record_at(&self, outcome: &CallOutcome, now: u64) {
        let failed = self.is_failure(outcome);
        let slot = self.slot_at(now, false);
        slot.total.fetch_add(1, Ordering::AcqRel);
        if failed {
            slot.failures.fetch_add(1, Ordering::AcqRel);
        }

        match self.state() {
            CircuitBreakerState::Closed => {
                if !failed {
                    return;
                }
                let (total, failures) = self.counts_at(now);
                if total >= self.config.min_samples as u64
                    && failures as f64 / total as f64 >= self.config.fail_ratio
                {
                    tracing::debug!(total, failures, "failure ratio reached");
                    self.trip(CircuitBreakerState::Closed, now);
                }
            }
            CircuitBreakerState::HalfOpen => {
                if failed {
                    self.trip(CircuitBreakerState::HalfOpen, now);
                } else if self.transition(CircuitBreakerState::HalfOpen, CircuitBreakerState::Closed) {
                    self.window_floor_ms.store(now, Ordering::Release);
                    self.slot_at(now, true);
                    tracing::info!("circuit closed after successful trial call");
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn allow_at(&self, now: u64) -> bool {
        let break_ms = self.config.break_time.as_millis() as u64;
        match self.state() {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::HalfOpen => {
                // a trial call that never reports back must not hold the circuit forever
                let since = self.trial_since_ms.load(Ordering::Acquire);
                if now.saturating_sub(since) < break_ms {
                    return false;
                }
                let won = self
                    .trial_since_ms
                    .compare_exchange(since, now, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if won {
                    tracing::warn!(silent_ms = now.saturating_sub(since), "trial call never reported, admitting another");
                }
                won
            }
            CircuitBreakerState::Open => {
                let since = now.saturating_sub(self.break_start_ms.load(Ordering::Acquire));
                if since < break_ms {
                    return false;
                }
                self.trial_since_ms.store(now, Ordering::Release);
                let won = self.transition(CircuitBreakerState::Open, CircuitBreakerState::HalfOpen);
                if won {
                    tracing::info!("circuit half-open, admitting trial call");
                }
                won
            }
        }
    }
}

impl CircuitBreaker for SlidingWindowBreaker {
    fn allow_request(&self) -> bool {
        self.allow_at(self.now_ms())
    }

    fn record(&self, outcome: &CallOutcome) {
        self.record_at(outcome, self.now_ms());
    }

    fn state(&self) -> CircuitBreakerState {
        CircuitBreakerState::from_u8(self.state.load(Ordering::Acquire))
    }
}

type BreakerFactory = dyn Fn(&Endpoint) -> Arc<dyn CircuitBreaker> + Send + Sync;

/// Endpoint → breaker map. Breakers are created on first lookup and kept
/// for the life of the registry.
pub struct BreakerRegistry {
    breakers: DashMap<Endpoint, Arc<dyn CircuitBreaker>>,
    factory: Box<BreakerFactory>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_factory(move |_| -> Arc<dyn CircuitBreaker> {
            Arc::new(SlidingWindowBreaker::new(config.clone()))
        })
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&Endpoint) -> Arc<dyn CircuitBreaker> + Send + Sync + 'static,
    {
        Self {
            breakers: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Arc<dyn CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(endpoint) {
            return breaker.value().clone();
        }
        self.breakers
            .entry(endpoint.clone())
            .or_insert_with(|| (self.factory)(endpoint))
            .value()
            .clone()
    }

    pub fn allow_request(&self, endpoint: &Endpoint) -> bool {
        self.get(endpoint).allow_request()
    }

    /// Records `outcome` against its endpoint's breaker. Outcomes without an
    /// endpoint never reached a provider and are ignored.
    pub fn record(&self, outcome: &CallOutcome) {
        if let Some(endpoint) = &outcome.endpoint {
            self.get(endpoint).record(outcome);
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
