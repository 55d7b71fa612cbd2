use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use parking_lot::RwLock;
use quanta::Clock;
use quanta::Instant;

use crate::config::CounterConfig;
use crate::worker::Worker;
use crate::Counter;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Shards per CPU; spreads bucket traffic across independent lock domains.
const SHARDS_PER_CPU: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
struct SlotCell {
    /// Start of the slot's precision interval, in nanoseconds since the
    /// anchor; zero means the slot is empty.
    timestamp: u64,
    count: u64,
}

struct Shard {
    /// Held read by `incr` and `current_qps`; held write only by the
    /// cleaner when it swaps the slot array wholesale.
    slots: RwLock<Vec<RwLock<SlotCell>>>,
}

/// A sliding-window counter sharded across fine-grained locks.
///
/// A two-dimensional ring: shards x slots, with a per-slot writer lock
/// under a shard-level reader lock. Writers on different slots never wait
/// on each other; the cleaner swaps each shard's slot array wholesale so
/// expired cells cannot be resurrected by a racing writer.
pub struct ShardedWindow {
    shards: Arc<Vec<Shard>>,
    slot_count: usize,
    window_ns: u64,
    precision_ns: u64,
    clock: Clock,
    anchor: Instant,
    cleaner: Mutex<Option<Worker>>,
}

impl ShardedWindow {
    pub fn new(config: &CounterConfig) -> Self {
        Self::with_shards(config, default_shard_count())
    }

    pub fn with_shards(config: &CounterConfig, shard_count: usize) -> Self {
        Self::with_clock(config, shard_count.max(1), Clock::new())
    }

    pub fn with_clock(config: &CounterConfig, shard_count: usize, clock: Clock) -> Self {
        let anchor = clock.now();
        let slot_count = config.slots;
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard {
                slots: new_slot_array(slot_count),
            });
        }
        let shards = Arc::new(shards);

        let window = ShardedWindow {
            shards: Arc::clone(&shards),
            slot_count,
            window_ns: config.window_ns(),
            precision_ns: config.precision_ns(),
            clock: clock.clone(),
            anchor,
            cleaner: Mutex::new(None),
        };

        let window_ns = window.window_ns;
        let cleaner = Worker::spawn(config.precision, move || {
            let now = clock.now().duration_since(anchor).as_nanos() as u64 + window_ns;
            cleanup_expired(&shards, slot_count, now - window_ns);
        });
        *window.cleaner.lock() = Some(cleaner);

        window
    }

    /// The clock starts one window in the past so a zero timestamp always
    /// means an empty slot and `now - window` never underflows.
    fn now_ns(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64 + self.window_ns
    }

    #[cfg(test)]
    fn cleanup_now(&self) {
        let now = self.now_ns();
        cleanup_expired(&self.shards, self.slot_count, now - self.window_ns);
    }
}

impl Counter for ShardedWindow {
    #[inline]
    fn incr(&self) {
        let now = self.now_ns();
        let bucket = now / self.precision_ns;
        let slot_time = now - (now % self.precision_ns);

        let shard = &self.shards[(bucket % self.shards.len() as u64) as usize];
        let slots = shard.slots.read();
        let mut cell = slots[(bucket % self.slot_count as u64) as usize].write();

        if cell.timestamp < slot_time {
            cell.timestamp = slot_time;
        }
        cell.count += 1;
    }

    fn current_qps(&self) -> f64 {
        let now = self.now_ns();
        let window_start = now - self.window_ns;

        let mut total = 0u64;
        for shard in self.shards.iter() {
            let slots = shard.slots.read();
            for slot in slots.iter() {
                let cell = slot.read();
                if cell.timestamp >= window_start {
                    total += cell.count;
                }
            }
        }

        total as f64 * (NANOS_PER_SEC as f64 / self.window_ns as f64)
    }

    fn stop(&self) {
        if let Some(cleaner) = self.cleaner.lock().take() {
            cleaner.stop();
        }
    }
}

fn default_shard_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * SHARDS_PER_CPU
}

fn new_slot_array(slot_count: usize) -> RwLock<Vec<RwLock<SlotCell>>> {
    let mut slots = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        slots.push(RwLock::new(SlotCell::default()));
    }
    RwLock::new(slots)
}

/// Swaps in a fresh slot array per shard, carrying over only in-window
/// cells. Allocation happens here, never on the event path.
fn cleanup_expired(shards: &[Shard], slot_count: usize, window_start: u64) {
    for shard in shards {
        let mut slots = shard.slots.write();
        let mut fresh = Vec::with_capacity(slot_count);
        for slot in slots.iter_mut() {
            let cell = *slot.get_mut();
            if cell.timestamp >= window_start && cell.timestamp > 0 {
                fresh.push(RwLock::new(cell));
            } else {
                fresh.push(RwLock::new(SlotCell::default()));
            }
        }
        *slots = fresh;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn mock_window() -> (ShardedWindow, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let cfg = CounterConfig {
            window: Duration::from_secs(1),
            slots: 10,
            precision: Duration::from_millis(100),
        };
        (ShardedWindow::with_clock(&cfg, 4, clock), mock)
    }

    #[test]
    fn it_counts_within_a_single_bucket() {
        let (window, _mock) = mock_window();

        for _ in 0..5 {
            window.incr();
        }

        assert_eq!(window.current_qps(), 5.0);
        window.stop();
    }

    #[test]
    fn it_slides_old_buckets_out_of_the_window() {
        let (window, mock) = mock_window();

        for _ in 0..3 {
            window.incr();
        }
        mock.increment(Duration::from_millis(100));
        for _ in 0..2 {
            window.incr();
        }

        assert_eq!(window.current_qps(), 5.0);

        mock.increment(Duration::from_millis(950));
        assert_eq!(window.current_qps(), 2.0);

        mock.increment(Duration::from_millis(200));
        assert_eq!(window.current_qps(), 0.0);
        window.stop();
    }

    #[test]
    fn it_reports_zero_after_full_inactivity() {
        let (window, mock) = mock_window();

        for _ in 0..100 {
            window.incr();
        }
        mock.increment(Duration::from_millis(1100));

        assert_eq!(window.current_qps(), 0.0);
        window.stop();
    }

    #[test]
    fn test_cleanup_swaps_out_expired_cells() {
        let (window, mock) = mock_window();

        for _ in 0..7 {
            window.incr();
        }
        mock.increment(Duration::from_millis(1200));
        window.cleanup_now();

        for shard in window.shards.iter() {
            let slots = shard.slots.read();
            for slot in slots.iter() {
                let cell = slot.read();
                assert_eq!(cell.timestamp, 0);
                assert_eq!(cell.count, 0);
            }
        }
        window.stop();
    }

    #[test]
    fn test_cleanup_preserves_live_cells() {
        let (window, mock) = mock_window();

        window.incr();
        mock.increment(Duration::from_millis(300));
        window.cleanup_now();

        assert_eq!(window.current_qps(), 1.0);
        window.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (window, _mock) = mock_window();
        window.stop();
        window.stop();
    }
}
