//! Process memory sampling for the soft memory threshold.

use parking_lot::Mutex;
use sysinfo::{ProcessesToUpdate, System};

/// Source of the current process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in MiB, if it can be read.
    fn resident_mb(&self) -> Option<u64>;
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    /// Create a probe for the current process.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_mb(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        system.process(pid).map(|p| p.memory() / (1024 * 1024))
    }
}
