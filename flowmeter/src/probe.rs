use parking_lot::Mutex;
use sysinfo::Pid;
use sysinfo::System;

/// Live process statistics consumed by the adaptive controller, the
/// limiter's adjuster, and the metrics sampler.
///
/// Injected as a trait so tests can drive memory pressure deterministically
/// and so the serving layer can supply its runtime's task count.
pub trait RuntimeProbe: Send + Sync {
    /// Resident memory of the current process, in bytes.
    fn memory_bytes(&self) -> u64;

    /// Number of live runtime tasks, when the embedding runtime exposes one.
    fn task_count(&self) -> usize {
        0
    }

    /// Process CPU usage as a percentage of one core.
    fn cpu_percent(&self) -> f32 {
        0.0
    }
}

/// [`RuntimeProbe`] backed by the operating system via `sysinfo`.
pub struct ProcessProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().unwrap_or_else(|_| Pid::from_u32(0)),
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeProbe for ProcessProbe {
    fn memory_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_process(self.pid);
        system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }

    fn cpu_percent(&self) -> f32 {
        let mut system = self.system.lock();
        system.refresh_process(self.pid);
        // Meaningful from the second refresh onwards; 0.0 before that.
        system
            .process(self.pid)
            .map(|p| p.cpu_usage())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_probe_reports_own_memory() {
        let probe = ProcessProbe::new();
        assert!(probe.memory_bytes() > 0, "a live process occupies memory");
    }
}
