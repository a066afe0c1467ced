//! CPU pinning for rx threads

use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Pick the CPU for rx thread `index` from `mask`.
///
/// Threads take the CPUs in the mask round-robin. An empty mask means no
/// pinning.
pub fn select_cpu(mask: u8, index: usize) -> Option<usize> {
    let cpus: Vec<usize> = (0..u8::BITS as usize)
        .filter(|bit| mask & (1 << bit) != 0)
        .collect();
    if cpus.is_empty() {
        return None;
    }
    Some(cpus[index % cpus.len()])
}

/// Pin the calling thread. Failure is logged and otherwise ignored.
pub(crate) fn pin_current_thread(thread: &str, mask: u8, index: usize) {
    let Some(cpu) = select_cpu(mask, index) else {
        return;
    };

    let mut set = CpuSet::new();
    if let Err(e) = set.set(cpu) {
        warn!(thread, cpu, error = %e, "CPU out of range for affinity set");
        return;
    }

    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => debug!(thread, cpu, "Pinned rx thread"),
        Err(e) => warn!(thread, cpu, error = %e, "Failed to set rx thread affinity"),
    }
}
