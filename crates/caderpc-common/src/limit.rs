//! Admission Limiters for caderpc
//!
//! Two limiter shapes share the [`Limiter`] contract:
//!
//! - **[`ConcurrencyLimiter`]**: a fixed-size counting semaphore. Used as the
//!   global cap on calls in flight. Permits come back through `release`.
//! - **[`RateLimiter`]**: a token bucket that refills continuously at
//!   `capacity` tokens per second. Used per endpoint (consumer) or per
//!   connection (provider) to cap throughput. `release` is a no-op: spent
//!   tokens only come back through refill.
//!
//! Both are lock-free and safe to share behind an `Arc`.
//!
//! # Example
//!
//! ```
//! use caderpc_common::limit::{ConcurrencyLimiter, Limiter, RateLimiter};
//!
//! let inflight = ConcurrencyLimiter::new(2);
//! assert!(inflight.try_acquire());
//! assert!(inflight.try_acquire());
//! assert!(!inflight.try_acquire());
//! inflight.release(1);
//! assert!(inflight.try_acquire());
//!
//! let per_channel = RateLimiter::new(1_000);
//! assert!(per_channel.try_acquire());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Semaphore;

/// Shared admission contract.
pub trait Limiter: Send + Sync {
    /// Takes one permit if one is available. Never blocks.
    fn try_acquire(&self) -> bool;

    /// Gives back `permits` previously taken.
    fn release(&self, permits: usize);
}

/// Counting semaphore with a fixed number of permits.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Semaphore,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Limiter for ConcurrencyLimiter {
    fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                // ownership of the permit moves to the caller until release()
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    fn release(&self, permits: usize) {
        if permits > 0 {
            self.semaphore.add_permits(permits);
        }
    }
}

/// Lock-free token bucket.
///
/// The bucket holds at most `capacity` tokens and gains one every
/// `1s / capacity`. Refill advances `last_refill` only by the time that was
/// actually turned into tokens, so the fractional remainder carries over to
/// the next refill. Concurrent refillers race on a compare-and-swap of
/// `last_refill`; only the winner credits tokens.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u64,
    nanos_per_token: u64,
    tokens: AtomicU64,
    /// Nanoseconds since `origin` up to which tokens have been credited.
    last_refill: AtomicU64,
    origin: Instant,
}

impl RateLimiter {
    /// A full bucket refilling at `capacity` tokens per second.
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            nanos_per_token: (1_000_000_000 / capacity).max(1),
            tokens: AtomicU64::new(capacity),
            last_refill: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens currently in the bucket, after crediting elapsed time.
    pub fn available(&self) -> u64 {
        self.refill(self.now_nanos());
        self.tokens.load(Ordering::Acquire)
    }

    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn refill(&self, now: u64) {
        let last = self.last_refill.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(last);
        let new_tokens = elapsed / self.nanos_per_token;
        if new_tokens == 0 {
            return;
        }

        let advanced = last + new_tokens * self.nanos_per_token;
        if self
            .last_refill
            .compare_exchange(last, advanced, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // another caller credited this interval
            return;
        }

        let capacity = self.capacity;
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(capacity.min(current.saturating_add(new_tokens)))
            });
    }

    fn try_acquire_at(&self, now: u64) -> bool {
        self.refill(now);
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(1))
            .is_ok()
    }
}

impl Limiter for RateLimiter {
    fn try_acquire(&self) -> bool {
        self.try_acquire_at(self.now_nanos())
    }

    fn release(&self, _permits: usize) {}
}
