//! # flowmeter
//!
//! `flowmeter` measures the rate of events (requests per second) observed by a
//! process in real time, and decides whether each arriving event should be
//! admitted or shed.
//!
//! ## Core Philosophy
//!
//! The event path must stay cheap under heavy thread contention. Both counter
//! variants keep their hot path allocation-free: the lock-free variant uses
//! atomic slots and Compare-And-Swap (CAS) loops, the sharded variant uses
//! short-critical-section reader/writer locks spread across shards. Everything
//! periodic (slot cleanup, adaptive tuning, metric sampling) runs on background
//! worker threads that never touch the event path's locks.
//!
//! ## Key Concepts
//!
//! * **Counter**: a unified interface over the sliding-window estimators.
//! * **Sliding window**: a ring of time slots covering the last `window`;
//!   expired slots are filtered on read, so correctness never depends on the
//!   cleanup worker keeping up.
//! * **Admission**: a token bucket ([`RateLimiter`]) plus a drain-aware
//!   lifecycle gate ([`GracefulShutdown`]) decide what gets counted.
//!
//! ## Example
//!
//! ```rust
//! use flowmeter::{new_counter, CounterConfig, CounterKind};
//!
//! let counter = new_counter(CounterKind::LockFree, CounterConfig::default()).unwrap();
//!
//! counter.incr();
//! assert!(counter.current_qps() >= 1.0);
//! counter.stop();
//! ```

use std::sync::Arc;

mod adaptive_sharding;
mod config;
mod lifecycle;
mod lockfree_window;
mod probe;
mod sampler;
mod sharded_window;
mod token_bucket;
mod worker;

pub use adaptive_sharding::AdaptiveOptions;
pub use adaptive_sharding::AdaptiveSharding;
pub use adaptive_sharding::ShardingStats;
pub use config::ConfigError;
pub use config::CounterConfig;
pub use lifecycle::GracefulShutdown;
pub use lifecycle::RequestGuard;
pub use lifecycle::ShutdownError;
pub use lifecycle::ShutdownStatus;
pub use lockfree_window::LockFreeWindow;
pub use probe::ProcessProbe;
pub use probe::RuntimeProbe;
pub use sampler::MetricsSampler;
pub use sharded_window::ShardedWindow;
pub use token_bucket::AdjusterOptions;
pub use token_bucket::LimiterStats;
pub use token_bucket::RateLimiter;

/// The core trait for sliding-window rate estimators.
///
/// Counters must be `Send` and `Sync` to allow sharing across thread
/// boundaries via `Arc`.
pub trait Counter: Send + Sync {
    /// Records a single event. Always succeeds.
    fn incr(&self);

    /// Reports the event rate over the last window, scaled to events per
    /// second. Equal to the raw window total when the window is one second.
    fn current_qps(&self) -> f64;

    /// Stops the counter's cleanup worker. Idempotent; `incr` and
    /// `current_qps` remain valid afterwards.
    fn stop(&self);
}

/// Which counter implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    LockFree,
    Sharded,
}

/// Configuration-driven counter construction.
///
/// # Errors
///
/// Returns [`ConfigError`] if the configuration violates the window
/// invariants (see [`CounterConfig::validate`]).
pub fn new_counter(
    kind: CounterKind,
    config: CounterConfig,
) -> Result<Arc<dyn Counter>, ConfigError> {
    config.validate()?;
    match kind {
        CounterKind::LockFree => Ok(Arc::new(LockFreeWindow::new(&config))),
        CounterKind::Sharded => Ok(Arc::new(ShardedWindow::new(&config))),
    }
}
