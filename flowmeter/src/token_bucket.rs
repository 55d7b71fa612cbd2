use std::num::NonZeroU64;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use serde::Serialize;

use crate::probe::RuntimeProbe;
use crate::worker::Worker;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// How often a rejection is worth a log line; one warning per this many.
const REJECTION_LOG_EVERY: u64 = 100;

struct Bucket {
    /// Effective refill rate, tokens per second.
    rate: f64,
    /// Operator-configured rate; the adjuster always derives the effective
    /// rate from this, so adjustments never stack.
    base_rate: f64,
    burst: f64,
    tokens: f64,
    /// Nanoseconds since the anchor at the last refill.
    last_refill: u64,
}

impl Bucket {
    fn refill(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill);
        let added = elapsed as f64 * self.rate / NANOS_PER_SEC as f64;
        self.tokens = (self.tokens + added).min(self.burst);
        self.last_refill = now;
    }
}

/// Options for the limiter's memory-pressure adjuster.
#[derive(Debug, Clone)]
pub struct AdjusterOptions {
    /// Live memory above which the effective rate is reduced.
    pub memory_threshold: u64,
    /// Multiplier applied to the base rate while under pressure.
    pub adjust_factor: f64,
    pub interval: Duration,
}

impl Default for AdjusterOptions {
    fn default() -> Self {
        Self {
            memory_threshold: 1 << 30,
            adjust_factor: 0.8,
            interval: Duration::from_secs(5),
        }
    }
}

/// A snapshot of the limiter's state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub rate: f64,
    pub burst: f64,
    pub tokens: f64,
    pub enabled: bool,
    pub total: u64,
    pub rejected: u64,
    pub reject_rate: f64,
}

/// A token-bucket admission controller with live tuning.
///
/// Tokens refill lazily on each `allow` call, so no timer is needed for
/// the bucket itself; fractional tokens accumulate between calls. An
/// optional background adjuster lowers the effective rate while process
/// memory stays above a threshold.
pub struct RateLimiter {
    state: Mutex<Bucket>,
    enabled: AtomicBool,
    total: AtomicU64,
    rejected: AtomicU64,
    clock: Clock,
    anchor: Instant,
    adjuster: Mutex<Option<Worker>>,
}

impl RateLimiter {
    pub fn new(rate: NonZeroU64, burst: NonZeroU64) -> Self {
        Self::with_clock(rate, burst, Clock::new())
    }

    pub fn with_clock(rate: NonZeroU64, burst: NonZeroU64, clock: Clock) -> Self {
        let anchor = clock.now();
        Self {
            state: Mutex::new(Bucket {
                rate: rate.get() as f64,
                base_rate: rate.get() as f64,
                burst: burst.get() as f64,
                // The bucket starts full.
                tokens: burst.get() as f64,
                last_refill: 0,
            }),
            enabled: AtomicBool::new(true),
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            clock,
            anchor,
            adjuster: Mutex::new(None),
        }
    }

    fn now_ns(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }

    /// Consumes one token if available.
    ///
    /// Returns `true` unconditionally while disabled, without touching the
    /// bucket or the counters.
    pub fn allow(&self) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return true;
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        let now = self.now_ns();

        let mut bucket = self.state.lock();
        bucket.refill(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return true;
        }
        drop(bucket);

        let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
        if rejected % REJECTION_LOG_EVERY == 0 {
            let total = self.total.load(Ordering::Relaxed);
            tracing::warn!(
                rejected,
                total,
                reject_rate = rejected as f64 / total.max(1) as f64,
                "requests rejected by rate limiter"
            );
        }
        false
    }

    /// Updates the refill rate; takes effect on the next refill.
    pub fn set_rate(&self, rate: NonZeroU64) {
        let mut bucket = self.state.lock();
        bucket.base_rate = rate.get() as f64;
        bucket.rate = rate.get() as f64;
        tracing::info!(new_rate = rate.get(), "rate limiter rate updated");
    }

    /// Live enable/disable. Disabling does not drain tokens; re-enabling
    /// resumes refill from the stored token count.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        tracing::info!(enabled, "rate limiter state updated");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LimiterStats {
        let bucket = self.state.lock();
        let total = self.total.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        LimiterStats {
            rate: bucket.rate,
            burst: bucket.burst,
            tokens: bucket.tokens,
            enabled: self.enabled.load(Ordering::Acquire),
            total,
            rejected,
            reject_rate: rejected as f64 / total.max(1) as f64,
        }
    }

    /// Starts the memory-pressure adjuster. No-op if already running.
    pub fn spawn_adjuster(self: &Arc<Self>, probe: Arc<dyn RuntimeProbe>, options: AdjusterOptions) {
        let mut slot = self.adjuster.lock();
        if slot.is_some() {
            return;
        }
        let limiter = Arc::clone(self);
        *slot = Some(Worker::spawn(options.interval, move || {
            limiter.adjust_rate(probe.as_ref(), &options);
        }));
    }

    fn adjust_rate(&self, probe: &dyn RuntimeProbe, options: &AdjusterOptions) {
        let memory = probe.memory_bytes();
        let pressured = memory > options.memory_threshold;

        let mut bucket = self.state.lock();
        let target = if pressured {
            bucket.base_rate * options.adjust_factor
        } else {
            bucket.base_rate
        };
        if (bucket.rate - target).abs() > f64::EPSILON {
            bucket.rate = target;
            tracing::info!(new_rate = target, memory, pressured, "rate limiter rate adjusted");
        }
    }

    /// Stops the adjuster worker, if any. Idempotent.
    pub fn stop(&self) {
        if let Some(adjuster) = self.adjuster.lock().take() {
            adjuster.stop();
        }
    }

    #[cfg(test)]
    pub(crate) fn set_tokens(&self, tokens: f64) {
        self.state.lock().tokens = tokens;
    }
}
