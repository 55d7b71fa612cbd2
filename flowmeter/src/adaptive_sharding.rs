use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

use crate::probe::RuntimeProbe;
use crate::worker::Worker;
use crate::Counter;

/// QPS change rate beyond which the shard signal grows.
const SCALE_UP_THRESHOLD: f64 = 0.3;
/// QPS change rate below which the shard signal shrinks.
const SCALE_DOWN_THRESHOLD: f64 = -0.3;

/// Options for the adaptive sharding controller.
#[derive(Debug, Clone)]
pub struct AdaptiveOptions {
    pub min_shards: usize,
    pub max_shards: usize,
    /// Live memory above which the signal is clamped to `min_shards`.
    pub memory_threshold: u64,
    pub interval: Duration,
}

impl Default for AdaptiveOptions {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            min_shards: cpus,
            max_shards: cpus * 8,
            memory_threshold: 1 << 30,
            interval: Duration::from_secs(10),
        }
    }
}

/// A snapshot of the controller's state.
#[derive(Debug, Clone, Serialize)]
pub struct ShardingStats {
    pub current_shards: usize,
    pub min_shards: usize,
    pub max_shards: usize,
    pub current_qps: f64,
    pub memory_usage: u64,
    pub memory_threshold: u64,
    pub qps_weight: f64,
    pub memory_weight: f64,
    pub last_adjust_unix: u64,
}

/// A periodic feedback loop deriving a shard-count signal from load.
///
/// The signal grows when QPS climbs more than 30% between ticks, shrinks
/// when it falls more than 30%, and is clamped to the minimum outright
/// while live memory exceeds the threshold. The signal is advisory: the
/// counters fix their physical shard count at construction and never
/// consult it.
pub struct AdaptiveSharding {
    counter: Arc<dyn Counter>,
    probe: Arc<dyn RuntimeProbe>,
    min_shards: usize,
    max_shards: usize,
    current_shards: AtomicUsize,
    /// f64 bit patterns; `last_qps` pairs with `last_memory` per tick.
    last_qps: AtomicU64,
    last_memory: AtomicU64,
    memory_threshold: AtomicU64,
    qps_weight: AtomicU64,
    memory_weight: AtomicU64,
    last_adjust_unix: AtomicU64,
    /// Skip-tick guard; a tick that finds it held returns immediately.
    adjusting: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl AdaptiveSharding {
    pub fn new(
        counter: Arc<dyn Counter>,
        probe: Arc<dyn RuntimeProbe>,
        options: AdaptiveOptions,
    ) -> Arc<Self> {
        let min_shards = options.min_shards.max(1);
        let max_shards = options.max_shards.max(min_shards);

        let controller = Arc::new(Self {
            counter,
            probe,
            min_shards,
            max_shards,
            current_shards: AtomicUsize::new(min_shards),
            last_qps: AtomicU64::new(0f64.to_bits()),
            last_memory: AtomicU64::new(0),
            memory_threshold: AtomicU64::new(options.memory_threshold),
            qps_weight: AtomicU64::new(0.6f64.to_bits()),
            memory_weight: AtomicU64::new(0.4f64.to_bits()),
            last_adjust_unix: AtomicU64::new(unix_now()),
            adjusting: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let ticker = Arc::clone(&controller);
        *controller.worker.lock() = Some(Worker::spawn(options.interval, move || {
            ticker.adjust();
        }));

        controller
    }

    pub fn current_shards(&self) -> usize {
        self.current_shards.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ShardingStats {
        ShardingStats {
            current_shards: self.current_shards(),
            min_shards: self.min_shards,
            max_shards: self.max_shards,
            current_qps: self.counter.current_qps(),
            memory_usage: self.probe.memory_bytes(),
            memory_threshold: self.memory_threshold.load(Ordering::Acquire),
            qps_weight: f64::from_bits(self.qps_weight.load(Ordering::Acquire)),
            memory_weight: f64::from_bits(self.memory_weight.load(Ordering::Acquire)),
            last_adjust_unix: self.last_adjust_unix.load(Ordering::Acquire),
        }
    }

    /// Updates the memory clamp threshold; a zero value is ignored.
    pub fn set_memory_threshold(&self, bytes: u64) {
        if bytes > 0 {
            self.memory_threshold.store(bytes, Ordering::Release);
            tracing::info!(new_threshold = bytes, "memory threshold updated");
        }
    }

    /// Updates the scoring weights, normalized to sum to one. Rejected if
    /// either weight is negative or both are zero.
    pub fn set_weights(&self, qps_weight: f64, memory_weight: f64) {
        if qps_weight < 0.0 || memory_weight < 0.0 || qps_weight + memory_weight <= 0.0 {
            return;
        }
        let total = qps_weight + memory_weight;
        self.qps_weight
            .store((qps_weight / total).to_bits(), Ordering::Release);
        self.memory_weight
            .store((memory_weight / total).to_bits(), Ordering::Release);
        tracing::info!(
            qps_weight = qps_weight / total,
            memory_weight = memory_weight / total,
            "sharding weights updated"
        );
    }

    fn adjust(&self) {
        if self
            .adjusting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.adjust_locked();
        self.adjusting.store(false, Ordering::Release);
    }

    fn adjust_locked(&self) {
        let qps_now = self.counter.current_qps();
        let qps_prev = f64::from_bits(self.last_qps.swap(qps_now.to_bits(), Ordering::AcqRel));
        let memory_now = self.probe.memory_bytes();
        self.last_memory.swap(memory_now, Ordering::AcqRel);
        let current = self.current_shards.load(Ordering::Acquire);

        let qps_change = if qps_prev > 0.0 {
            (qps_now - qps_prev) / qps_prev
        } else {
            0.0
        };

        tracing::debug!(
            qps = qps_now,
            qps_change,
            memory = memory_now,
            current_shards = current,
            "sharding controller tick"
        );

        let threshold = self.memory_threshold.load(Ordering::Acquire);
        let new = if memory_now > threshold && current > self.min_shards {
            // Hard memory-pressure release overrides the load signal.
            tracing::warn!(
                memory = memory_now,
                threshold,
                new_shards = self.min_shards,
                "memory over threshold, clamping shard signal to minimum"
            );
            self.min_shards
        } else if qps_change > SCALE_UP_THRESHOLD && current < self.max_shards {
            (current + current / 2).min(self.max_shards)
        } else if qps_change < SCALE_DOWN_THRESHOLD && current > self.min_shards {
            (current - current * 3 / 10).max(self.min_shards)
        } else {
            return;
        };

        if new != current {
            self.current_shards.store(new, Ordering::Release);
            self.last_adjust_unix.store(unix_now(), Ordering::Release);
            tracing::info!(
                from = current,
                to = new,
                qps = qps_now,
                "shard signal adjusted"
            );
        }
    }

    /// Stops the periodic worker. Idempotent.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockCounter(AtomicU64);

    impl MockCounter {
        fn new(qps: f64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(qps.to_bits())))
        }

        fn set(&self, qps: f64) {
            self.0.store(qps.to_bits(), Ordering::Release);
        }
    }

    impl Counter for MockCounter {
        fn incr(&self) {}

        fn current_qps(&self) -> f64 {
            f64::from_bits(self.0.load(Ordering::Acquire))
        }

        fn stop(&self) {}
    }

    struct FixedMemory(AtomicU64);

    impl FixedMemory {
        fn new(bytes: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(bytes)))
        }

        fn set(&self, bytes: u64) {
            self.0.store(bytes, Ordering::Release);
        }
    }

    impl RuntimeProbe for FixedMemory {
        fn memory_bytes(&self) -> u64 {
            self.0.load(Ordering::Acquire)
        }
    }

    fn options(interval: Duration) -> AdaptiveOptions {
        AdaptiveOptions {
            min_shards: 2,
            max_shards: 8,
            memory_threshold: 1 << 30,
            interval,
        }
    }

    // Long interval: ticks only happen when the test drives them.
    fn manual_controller(
        counter: Arc<MockCounter>,
        memory: Arc<FixedMemory>,
    ) -> Arc<AdaptiveSharding> {
        AdaptiveSharding::new(counter, memory, options(Duration::from_secs(3600)))
    }

    #[test]
    fn test_scale_up_on_qps_growth() {
        let counter = MockCounter::new(1000.0);
        let memory = FixedMemory::new(0);
        let asm = manual_controller(Arc::clone(&counter), memory);

        asm.adjust();
        assert_eq!(asm.current_shards(), 2, "first tick has no baseline");

        counter.set(5000.0);
        asm.adjust();
        assert_eq!(asm.current_shards(), 3, "2 + floor(2 * 0.5)");

        counter.set(25000.0);
        asm.adjust();
        assert_eq!(asm.current_shards(), 4, "3 + floor(3 * 0.5)");
        asm.stop();
    }

    #[test]
    fn test_scale_down_on_qps_drop() {
        let counter = MockCounter::new(1000.0);
        let memory = FixedMemory::new(0);
        let asm = manual_controller(Arc::clone(&counter), memory);

        // Grow to max first.
        asm.adjust();
        for qps in [5000.0, 25000.0, 125000.0, 625000.0, 3125000.0] {
            counter.set(qps);
            asm.adjust();
        }
        assert_eq!(asm.current_shards(), 8);

        counter.set(100.0);
        asm.adjust();
        assert_eq!(asm.current_shards(), 6, "8 - floor(8 * 0.3)");
        asm.stop();
    }

    #[test]
    fn test_small_changes_leave_the_signal_alone() {
        let counter = MockCounter::new(1000.0);
        let memory = FixedMemory::new(0);
        let asm = manual_controller(Arc::clone(&counter), memory);

        asm.adjust();
        counter.set(1100.0);
        asm.adjust();
        assert_eq!(asm.current_shards(), 2);
        asm.stop();
    }

    #[test]
    fn test_memory_clamp_overrides_load_signal() {
        let counter = MockCounter::new(1000.0);
        let memory = FixedMemory::new(0);
        let asm = manual_controller(Arc::clone(&counter), Arc::clone(&memory));

        asm.adjust();
        counter.set(5000.0);
        asm.adjust();
        assert!(asm.current_shards() > 2);

        // QPS keeps growing, but memory pressure wins.
        counter.set(25000.0);
        memory.set(2 << 30);
        asm.adjust();
        assert_eq!(asm.current_shards(), 2);
        asm.stop();
    }

    #[test]
    fn test_periodic_scale_up() {
        let counter = MockCounter::new(1000.0);
        let memory = FixedMemory::new(0);
        let asm = AdaptiveSharding::new(
            Arc::clone(&counter) as Arc<dyn Counter>,
            memory,
            options(Duration::from_millis(100)),
        );

        thread::sleep(Duration::from_millis(250));
        counter.set(5000.0);
        thread::sleep(Duration::from_millis(250));

        assert!(
            asm.current_shards() > 2,
            "signal should have grown, got {}",
            asm.current_shards()
        );
        asm.stop();
    }

    #[test]
    fn test_periodic_memory_clamp() {
        let counter = MockCounter::new(1000.0);
        let memory = FixedMemory::new(0);
        let asm = AdaptiveSharding::new(
            Arc::clone(&counter) as Arc<dyn Counter>,
            Arc::clone(&memory) as Arc<dyn RuntimeProbe>,
            AdaptiveOptions {
                min_shards: 2,
                max_shards: 8,
                memory_threshold: 1 << 20,
                interval: Duration::from_millis(100),
            },
        );

        thread::sleep(Duration::from_millis(250));
        counter.set(5000.0);
        thread::sleep(Duration::from_millis(250));
        assert!(asm.current_shards() > 2);

        memory.set(10 << 20);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(asm.current_shards(), 2);
        asm.stop();
    }

    #[test]
    fn test_weights_are_normalized() {
        let counter = MockCounter::new(0.0);
        let memory = FixedMemory::new(0);
        let asm = manual_controller(counter, memory);

        asm.set_weights(3.0, 1.0);
        let stats = asm.stats();
        assert!((stats.qps_weight - 0.75).abs() < 1e-9);
        assert!((stats.memory_weight - 0.25).abs() < 1e-9);

        // Invalid weights are rejected.
        asm.set_weights(-1.0, 2.0);
        assert!((asm.stats().qps_weight - 0.75).abs() < 1e-9);
        asm.stop();
    }

    #[test]
    fn test_zero_memory_threshold_is_ignored() {
        let counter = MockCounter::new(0.0);
        let memory = FixedMemory::new(0);
        let asm = manual_controller(counter, memory);

        let before = asm.stats().memory_threshold;
        asm.set_memory_threshold(0);
        assert_eq!(asm.stats().memory_threshold, before);

        asm.set_memory_threshold(42);
        assert_eq!(asm.stats().memory_threshold, 42);
        asm.stop();
    }
}
