//! Per-task status tracked for the lifetime of one attribution interval.

use log::warn;

use rapl_probes::proctime;

/// Distinguishes a single-threaded process (whose own cpu time is already
/// the process-wide figure) from one thread of a multi-threaded process
/// (whose siblings share the same address space, and therefore the same
/// resident memory — see the DRAM dedup in `engine::ascribe_energy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Process(i32),
    Thread { tid: i32, group_pid: i32 },
}

impl TargetKind {
    pub fn task_id(self) -> i32 {
        match self {
            TargetKind::Process(pid) => pid,
            TargetKind::Thread { tid, .. } => tid,
        }
    }
}

/// Tracks one task's (process or thread) CPU time and socket residency over
/// a single attribution interval. Rebuilt from scratch at the start of every
/// interval (see `status_store::StatusStore::reset_for_interval`).
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub task_id: i32,
    pub last_cpu_time_sec: f64,
    pub cpu_time_delta_sec: f64,
    /// Count of sampler ticks this task was observed scheduled on each socket.
    pub socket_residence_counts: Vec<u64>,
    /// Private resident-memory samples (MiB) taken by the sampler, one inner
    /// vec per socket, growing by one element per sampler tick.
    pub numa_mem_samples: Vec<Vec<f64>>,
}

impl TargetStatus {
    pub fn new(task_id: i32, num_sockets: usize) -> TargetStatus {
        TargetStatus {
            task_id,
            last_cpu_time_sec: proctime::read_task_cputime_sec(task_id),
            cpu_time_delta_sec: 0.0,
            socket_residence_counts: vec![0; num_sockets],
            numa_mem_samples: vec![Vec::new(); num_sockets],
        }
    }

    /// Updates `cpu_time_delta_sec` from the task's current cumulative CPU
    /// time. Returns `false` (and logs) if the task has gone.
    pub fn record_cputime(&mut self) -> bool {
        if !proctime::task_exists(self.task_id) {
            return false;
        }
        let current = proctime::read_task_cputime_sec(self.task_id);
        let delta = current - self.last_cpu_time_sec;
        if delta < 0.0 {
            warn!("task {} cpu time went backwards ({delta}s), clamping to 0", self.task_id);
            self.cpu_time_delta_sec = 0.0;
        } else {
            self.cpu_time_delta_sec = delta;
        }
        self.last_cpu_time_sec = current;
        true
    }

    pub fn record_residence(&mut self, socket: u32) {
        if let Some(count) = self.socket_residence_counts.get_mut(socket as usize) {
            *count += 1;
        }
    }

    pub fn record_numa_mem(&mut self, private_mem_mib: &[f64]) {
        for (socket, &mib) in private_mem_mib.iter().enumerate() {
            if let Some(samples) = self.numa_mem_samples.get_mut(socket) {
                samples.push(mib);
            }
        }
    }

    /// `true` iff the sampler has recorded at least one residence tick for
    /// this task. Per §4.3, a task with no samples is dropped from
    /// ascription entirely rather than assigned a fabricated distribution —
    /// see `engine::ascribe_energy`, which checks this before calling
    /// `compute_socket_residence_probs`.
    pub fn was_sampled(&self) -> bool {
        self.socket_residence_counts.iter().sum::<u64>() > 0
    }

    /// Normalizes `socket_residence_counts` into probabilities. A single
    /// socket is trivially fully resident. Callers must only call this for a
    /// task that `was_sampled()` — the zero-ticks case has no meaningful
    /// distribution to report.
    pub fn compute_socket_residence_probs(&self, num_sockets: usize) -> Vec<f64> {
        if num_sockets < 2 {
            return vec![1.0];
        }
        let total: u64 = self.socket_residence_counts.iter().sum();
        self.socket_residence_counts
            .iter()
            .map(|&count| count as f64 / total as f64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residence_probs_normalize() {
        let status = TargetStatus {
            task_id: 1,
            last_cpu_time_sec: 0.0,
            cpu_time_delta_sec: 0.0,
            socket_residence_counts: vec![3, 1],
            numa_mem_samples: vec![Vec::new(), Vec::new()],
        };
        let probs = status.compute_socket_residence_probs(2);
        assert_eq!(probs, vec![0.75, 0.25]);
    }

    #[test]
    fn residence_probs_single_socket() {
        let status = TargetStatus {
            task_id: 1,
            last_cpu_time_sec: 0.0,
            cpu_time_delta_sec: 0.0,
            socket_residence_counts: vec![0],
            numa_mem_samples: vec![Vec::new()],
        };
        assert_eq!(status.compute_socket_residence_probs(1), vec![1.0]);
    }

    #[test]
    fn was_sampled_is_false_with_no_residence_ticks() {
        let status = TargetStatus {
            task_id: 1,
            last_cpu_time_sec: 0.0,
            cpu_time_delta_sec: 0.0,
            socket_residence_counts: vec![0, 0],
            numa_mem_samples: vec![Vec::new(), Vec::new()],
        };
        assert!(!status.was_sampled());
    }

    #[test]
    fn was_sampled_is_true_once_any_socket_has_a_tick() {
        let status = TargetStatus {
            task_id: 1,
            last_cpu_time_sec: 0.0,
            cpu_time_delta_sec: 0.0,
            socket_residence_counts: vec![0, 1],
            numa_mem_samples: vec![Vec::new(), Vec::new()],
        };
        assert!(status.was_sampled());
    }
}
