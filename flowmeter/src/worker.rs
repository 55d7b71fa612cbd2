use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;

/// A background thread that runs `tick` every `interval` until stopped.
///
/// The stop signal doubles as the timer: the worker sleeps in
/// `recv_timeout`, so dropping the sender wakes it immediately instead of
/// waiting out the current interval.
pub(crate) struct Worker {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, ticker) = mpsc::channel::<()>();
        let handle = thread::spawn(move || loop {
            match ticker.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => tick(),
                _ => return,
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Signals the thread and joins it.
    pub(crate) fn stop(mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_worker_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&ticks);
        let worker = Worker::spawn(Duration::from_millis(10), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(55));
        worker.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 ticks, got {seen}");

        // No further ticks once stopped.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
