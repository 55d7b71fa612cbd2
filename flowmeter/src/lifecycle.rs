use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// How often the drain reporter logs remaining in-flight requests.
const REPORT_INTERVAL: Duration = Duration::from_millis(500);

const COUNT_MASK: u64 = (1 << 56) - 1;
const PHASE_SHIFT: u32 = 56;

/// The lifecycle coordinator's externally visible state.
///
/// `as_str` values are wire-visible through the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    Running,
    ShuttingDown,
    TimeoutWaiting,
    GracefulComplete,
    DelayedComplete,
    Forced,
}

impl ShutdownStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::TimeoutWaiting => "timeout_waiting",
            Self::GracefulComplete => "graceful_shutdown_complete",
            Self::DelayedComplete => "delayed_shutdown_complete",
            Self::Forced => "force_shutdown",
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            2 => Self::TimeoutWaiting,
            3 => Self::GracefulComplete,
            4 => Self::DelayedComplete,
            _ => Self::Forced,
        }
    }
}

/// Error surfaced when the drain misses its hard deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    #[error("drain deadline exceeded")]
    DeadlineExceeded,
}

/// Tracks in-flight requests and guarantees every accepted request
/// finishes before the process exits.
///
/// The phase and the in-flight count live in one packed atomic word, so
/// `start_request` is a single CAS: there is no window where a request is
/// counted against a coordinator that will reject it.
///
/// Draining has two deadlines. When the soft timeout passes with requests
/// still in flight the status flips to `timeout_waiting` and the wait
/// continues; when the hard timeout passes the coordinator gives up,
/// marks itself forced, and reports a deadline error.
pub struct GracefulShutdown {
    /// Packed `(phase, in_flight)`: phase in the top byte, count below.
    word: AtomicU64,
    forced: AtomicBool,
    soft_timeout: Duration,
    hard_timeout: Duration,
    drain_lock: Mutex<()>,
    drained: Condvar,
    done: Mutex<bool>,
    done_cv: Condvar,
    result: Mutex<Option<Result<(), ShutdownError>>>,
}

impl GracefulShutdown {
    /// `max_wait` falls back to twice `timeout` when zero or below it.
    pub fn new(timeout: Duration, max_wait: Duration) -> Self {
        let hard_timeout = if max_wait < timeout || max_wait.is_zero() {
            timeout * 2
        } else {
            max_wait
        };
        Self {
            word: AtomicU64::new(pack(ShutdownStatus::Running, 0)),
            forced: AtomicBool::new(false),
            soft_timeout: timeout,
            hard_timeout,
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            result: Mutex::new(None),
        }
    }

    /// Admits a request if the coordinator is still running.
    pub fn start_request(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            if phase_of(word) != ShutdownStatus::Running {
                return false;
            }
            match self.word.compare_exchange_weak(
                word,
                word + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    /// Releases a request admitted by `start_request`.
    pub fn end_request(&self) {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            if count_of(word) == 0 {
                debug_assert!(false, "end_request without a matching start_request");
                tracing::error!("request released with none in flight");
                return;
            }
            match self.word.compare_exchange_weak(
                word,
                word - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => {
                    if count_of(previous) == 1 && phase_of(previous) != ShutdownStatus::Running {
                        // The drain may be waiting for this exact moment.
                        let _guard = self.drain_lock.lock();
                        self.drained.notify_all();
                    }
                    return;
                }
                Err(actual) => word = actual,
            }
        }
    }

    /// RAII variant of `start_request`; the guard releases on drop.
    pub fn request_guard(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.start_request() {
            Some(RequestGuard {
                lifecycle: Arc::clone(self),
            })
        } else {
            None
        }
    }

    pub fn active_requests(&self) -> u64 {
        count_of(self.word.load(Ordering::Acquire))
    }

    pub fn status(&self) -> ShutdownStatus {
        phase_of(self.word.load(Ordering::Acquire))
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    /// True once the coordinator has left `Running`.
    pub fn shutdown_started(&self) -> bool {
        self.status() != ShutdownStatus::Running
    }

    /// Blocks until shutdown has fully finished. This, not the status, is
    /// the single source of truth for "shutdown finished".
    pub fn wait_done(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.done_cv.wait(&mut done);
        }
    }

    /// Drains in-flight requests, enforcing the soft and hard deadlines.
    ///
    /// Idempotent: concurrent and subsequent calls block until the first
    /// drain finishes, then report its result.
    ///
    /// # Errors
    ///
    /// [`ShutdownError::DeadlineExceeded`] when in-flight requests remain
    /// at the hard deadline; the coordinator is then marked forced.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        let mut result = self.result.lock();
        if let Some(settled) = *result {
            return settled;
        }

        self.set_phase(ShutdownStatus::ShuttingDown);
        tracing::info!(
            active_requests = self.active_requests(),
            timeout = ?self.soft_timeout,
            max_wait = ?self.hard_timeout,
            "draining started"
        );

        let outcome = thread::scope(|scope| {
            let (stop_reporter, ticks) = mpsc::channel::<()>();
            scope.spawn(move || loop {
                match ticks.recv_timeout(REPORT_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {
                        let remaining = self.active_requests();
                        if remaining > 0 {
                            tracing::info!(remaining, "waiting for in-flight requests");
                        }
                    }
                    _ => return,
                }
            });
            let outcome = self.drain();
            drop(stop_reporter);
            outcome
        });

        *result = Some(outcome);
        let mut done = self.done.lock();
        *done = true;
        self.done_cv.notify_all();
        outcome
    }

    fn drain(&self) -> Result<(), ShutdownError> {
        let start = Instant::now();

        if self.wait_drained_until(start + self.soft_timeout) {
            self.set_phase(ShutdownStatus::GracefulComplete);
            tracing::info!("all requests finished, graceful shutdown complete");
            return Ok(());
        }

        self.set_phase(ShutdownStatus::TimeoutWaiting);
        tracing::warn!(
            remaining = self.active_requests(),
            "drain timeout passed, still waiting for in-flight requests"
        );

        if self.wait_drained_until(start + self.hard_timeout) {
            self.set_phase(ShutdownStatus::DelayedComplete);
            tracing::info!("all requests finished, delayed shutdown complete");
            return Ok(());
        }

        self.forced.store(true, Ordering::Release);
        self.set_phase(ShutdownStatus::Forced);
        tracing::error!(
            abandoned = self.active_requests(),
            "max wait exceeded, forcing shutdown"
        );
        Err(ShutdownError::DeadlineExceeded)
    }

    fn wait_drained_until(&self, deadline: Instant) -> bool {
        let mut guard = self.drain_lock.lock();
        while self.active_requests() > 0 {
            if self.drained.wait_until(&mut guard, deadline).timed_out() {
                return self.active_requests() == 0;
            }
        }
        true
    }

    fn set_phase(&self, phase: ShutdownStatus) {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let next = pack(phase, count_of(word));
            match self
                .word
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    tracing::info!(status = phase.as_str(), "lifecycle status changed");
                    return;
                }
                Err(actual) => word = actual,
            }
        }
    }
}

fn pack(phase: ShutdownStatus, count: u64) -> u64 {
    ((phase as u64) << PHASE_SHIFT) | count
}

fn phase_of(word: u64) -> ShutdownStatus {
    ShutdownStatus::from_bits((word >> PHASE_SHIFT) as u8)
}

fn count_of(word: u64) -> u64 {
    word & COUNT_MASK
}

/// Releases one in-flight request on drop.
pub struct RequestGuard {
    lifecycle: Arc<GracefulShutdown>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.lifecycle.end_request();
    }
}
