use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;

use crate::probe::RuntimeProbe;
use crate::worker::Worker;
use crate::Counter;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically publishes the counter's QPS and process statistics through
/// the `metrics` facade.
///
/// Gauge names are stable; dashboards depend on them.
pub struct MetricsSampler {
    counter: Arc<dyn Counter>,
    probe: Arc<dyn RuntimeProbe>,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl MetricsSampler {
    pub fn new(counter: Arc<dyn Counter>, probe: Arc<dyn RuntimeProbe>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        Self {
            counter,
            probe,
            interval,
            worker: Mutex::new(None),
        }
    }

    /// Starts the sampling worker. No-op if already running.
    pub fn start(&self) {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return;
        }
        let counter = Arc::clone(&self.counter);
        let probe = Arc::clone(&self.probe);
        *slot = Some(Worker::spawn(self.interval, move || {
            sample(counter.as_ref(), probe.as_ref());
        }));
    }

    /// Stops and joins the sampling worker. Idempotent.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

fn sample(counter: &dyn Counter, probe: &dyn RuntimeProbe) {
    gauge!("qps_counter_current_qps").set(counter.current_qps());
    gauge!("qps_counter_memory_usage_bytes").set(probe.memory_bytes() as f64);
    gauge!("qps_counter_cpu_usage_percent").set(probe.cpu_percent() as f64);
    gauge!("qps_counter_goroutines").set(probe.task_count() as f64);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;

    use super::*;

    struct CountingCounter(AtomicUsize);

    impl Counter for CountingCounter {
        fn incr(&self) {}

        fn current_qps(&self) -> f64 {
            self.0.fetch_add(1, Ordering::SeqCst);
            0.0
        }

        fn stop(&self) {}
    }

    struct NullProbe;

    impl RuntimeProbe for NullProbe {
        fn memory_bytes(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_sampler_polls_the_counter_until_stopped() {
        let counter = Arc::new(CountingCounter(AtomicUsize::new(0)));
        let sampler = MetricsSampler::new(
            Arc::clone(&counter) as Arc<dyn Counter>,
            Arc::new(NullProbe),
            Duration::from_millis(10),
        );

        sampler.start();
        // Starting twice must not double the workers.
        sampler.start();

        thread::sleep(Duration::from_millis(55));
        sampler.stop();
        let polls = counter.0.load(Ordering::SeqCst);
        assert!(polls >= 2, "expected at least 2 samples, got {polls}");

        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.0.load(Ordering::SeqCst), polls);

        // Stopping again is fine.
        sampler.stop();
    }

    #[test]
    fn test_zero_interval_falls_back_to_default() {
        let sampler = MetricsSampler::new(
            Arc::new(CountingCounter(AtomicUsize::new(0))),
            Arc::new(NullProbe),
            Duration::ZERO,
        );
        assert_eq!(sampler.interval, DEFAULT_INTERVAL);
    }
}
