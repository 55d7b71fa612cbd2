//! HTTP surface over the `flowmeter` core: event collection, live QPS and
//! stats queries, limiter tuning, health, and Prometheus exposition.

use std::sync::Arc;

use flowmeter::Counter;
use flowmeter::GracefulShutdown;
use flowmeter::ProcessProbe;
use flowmeter::RateLimiter;
use flowmeter::RuntimeProbe;

pub mod config;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod routes;


/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub counter: Arc<dyn Counter>,
    pub limiter: Arc<RateLimiter>,
    pub lifecycle: Arc<GracefulShutdown>,
}

/// [`RuntimeProbe`] that augments process statistics with the tokio
/// runtime's live task count.
pub struct TokioProbe {
    process: ProcessProbe,
    handle: tokio::runtime::Handle,
}

impl TokioProbe {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            process: ProcessProbe::new(),
            handle,
        }
    }
}

impl RuntimeProbe for TokioProbe {
    fn memory_bytes(&self) -> u64 {
        self.process.memory_bytes()
    }

    fn cpu_percent(&self) -> f32 {
        self.process.cpu_percent()
    }

    fn task_count(&self) -> usize {
        self.handle.metrics().num_alive_tasks()
    }
}
