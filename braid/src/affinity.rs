//! Progress-thread cpu affinity.
//!
//! The spec grammar is `a[-b[:stride]][,...]`: comma-separated entries, each
//! a single cpu, an inclusive range, or a strided range. Parsed into a cpu
//! list; application is a platform-gated system call.

use tracing::{error, warn};

/// Parse a cpu-set spec. Returns `None` (with a warning) on malformed input.
pub fn parse_cpu_spec(spec: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            warn!(spec, "Empty entry in cpu spec");
            return None;
        }
        let (range, stride) = match part.split_once(':') {
            Some((range, stride)) => (range, stride.parse::<usize>().ok()?),
            None => (part, 1),
        };
        if stride == 0 {
            warn!(spec, "Zero stride in cpu spec");
            return None;
        }
        let (first, last) = match range.split_once('-') {
            Some((a, b)) => (a.parse::<usize>().ok()?, b.parse::<usize>().ok()?),
            None => {
                let cpu = range.parse::<usize>().ok()?;
                (cpu, cpu)
            }
        };
        if last < first {
            warn!(spec, first, last, "Descending range in cpu spec");
            return None;
        }
        let mut cpu = first;
        while cpu <= last {
            cpus.push(cpu);
            cpu += stride;
        }
    }
    if cpus.is_empty() { None } else { Some(cpus) }
}

/// Pin the calling thread to the cpus named by `spec`.
pub fn apply_affinity(spec: &str) {
    let Some(cpus) = parse_cpu_spec(spec) else {
        error!(spec, "Ignoring malformed cpu affinity spec");
        return;
    };
    apply_cpus(&cpus);
}

#[cfg(target_os = "linux")]
fn apply_cpus(cpus: &[usize]) {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for &cpu in cpus {
        if let Err(e) = set.set(cpu) {
            warn!(cpu, error = %e, "Cpu out of range for affinity set");
        }
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        error!(error = %e, "sched_setaffinity failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_cpus(_cpus: &[usize]) {
    error!("Cpu affinity is not supported on this platform");
}
