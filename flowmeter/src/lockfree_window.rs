use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;

use crate::config::CounterConfig;
use crate::worker::Worker;
use crate::Counter;

const NANOS_PER_SEC: u64 = 1_000_000_000;

struct AtomicSlot {
    /// Nanoseconds since the anchor; zero means the slot is empty.
    timestamp: AtomicU64,
    count: AtomicU64,
}

/// A sliding-window counter with a fully lock-free event path.
///
/// Events land in a ring of atomic slots, one per precision interval.
/// Slot reuse is a CAS on the slot's timestamp; readers filter out slots
/// older than the window, so a lagging cleanup worker can never cause
/// stale counts to be reported.
pub struct LockFreeWindow {
    slots: Arc<Vec<AtomicSlot>>,
    window_ns: u64,
    precision_ns: u64,
    clock: Clock,
    anchor: Instant,
    cleaner: Mutex<Option<Worker>>,
}

impl LockFreeWindow {
    pub fn new(config: &CounterConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: &CounterConfig, clock: Clock) -> Self {
        let anchor = clock.now();
        let mut slots = Vec::with_capacity(config.slots);
        for _ in 0..config.slots {
            slots.push(AtomicSlot {
                timestamp: AtomicU64::new(0),
                count: AtomicU64::new(0),
            });
        }
        let slots = Arc::new(slots);

        let window = LockFreeWindow {
            slots: Arc::clone(&slots),
            window_ns: config.window_ns(),
            precision_ns: config.precision_ns(),
            clock: clock.clone(),
            anchor,
            cleaner: Mutex::new(None),
        };

        let window_ns = window.window_ns;
        let cleaner = Worker::spawn(config.precision, move || {
            let now = clock.now().duration_since(anchor).as_nanos() as u64 + window_ns;
            cleanup_expired(&slots, now - window_ns);
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
        cleanup_expired(&self.slots, now - self.window_ns);
    }
}

impl Counter for LockFreeWindow {
    #[inline]
    fn incr(&self) {
        let now = self.now_ns();
        let bucket = now / self.precision_ns;
        let slot = &self.slots[(bucket % self.slots.len() as u64) as usize];

        loop {
            let stored = slot.timestamp.load(Ordering::Acquire);
            if stored / self.precision_ns == bucket {
                // Fast path: the slot already belongs to our bucket.
                slot.count.fetch_add(1, Ordering::AcqRel);
                return;
            }

            if stored == 0 || stored / self.precision_ns < bucket {
                // Empty or stale slot: claim it for this bucket. The loser
                // of the race reloads and takes the fast path.
                if slot
                    .timestamp
                    .compare_exchange(stored, now, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.count.store(1, Ordering::Release);
                    return;
                }
                continue;
            }

            // A writer from the next interval claimed the slot first. Fold
            // the event into its bucket rather than spinning on an
            // unwinnable CAS; the error is bounded by one writer per slot.
            slot.count.fetch_add(1, Ordering::AcqRel);
            return;
        }
    }

    fn current_qps(&self) -> f64 {
        let now = self.now_ns();
        let window_start = now - self.window_ns;

        let mut total = 0u64;
        for slot in self.slots.iter() {
            if slot.timestamp.load(Ordering::Acquire) >= window_start {
                total += slot.count.load(Ordering::Acquire);
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

fn cleanup_expired(slots: &[AtomicSlot], window_start: u64) {
    for slot in slots {
        let ts = slot.timestamp.load(Ordering::Acquire);
        if ts > 0 && ts < window_start {
            // CAS so a writer reclaiming the slot concurrently wins.
            if slot
                .timestamp
                .compare_exchange(ts, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.count.store(0, Ordering::Release);
            }
        }
    }
}
