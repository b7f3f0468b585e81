//! The shared, mutex-guarded state read by the engine thread and written by
//! both the engine and the high-rate sampler thread.

use std::collections::{HashMap, HashSet};

use crate::target::TargetStatus;
use crate::targetset::Targets;

pub struct StatusStore {
    pub targets_status: HashMap<i32, TargetStatus>,
    pub processes: HashSet<i32>,
    /// tid -> owning thread-group pid.
    pub threads: HashMap<i32, i32>,
    pub server_numa_mem_samples: Vec<Vec<f64>>,
    num_sockets: usize,
}

impl StatusStore {
    pub fn new(num_sockets: usize) -> StatusStore {
        StatusStore {
            targets_status: HashMap::new(),
            processes: HashSet::new(),
            threads: HashMap::new(),
            server_numa_mem_samples: vec![Vec::new(); num_sockets],
            num_sockets,
        }
    }

    /// Replaces the tracked target set wholesale, discarding all samples
    /// accumulated during the previous interval. Mirrors the Python
    /// `empty_targets_status()` + target-set swap done once per interval.
    pub fn reset_for_interval(&mut self, targets: Targets) {
        let mut targets_status = HashMap::new();
        for &pid in &targets.processes {
            targets_status.insert(pid, TargetStatus::new(pid, self.num_sockets));
        }
        for &tid in targets.threads.keys() {
            targets_status.insert(tid, TargetStatus::new(tid, self.num_sockets));
        }

        self.targets_status = targets_status;
        self.processes = targets.processes;
        self.threads = targets.threads;
        self.server_numa_mem_samples = vec![Vec::new(); self.num_sockets];
    }

    /// Updates every tracked task's CPU-time delta. Returns the set of tasks
    /// that disappeared mid-interval so the caller can drop them.
    pub fn record_cputime(&mut self) -> Vec<i32> {
        let mut disappeared = Vec::new();
        for (&task_id, status) in self.targets_status.iter_mut() {
            if !status.record_cputime() {
                disappeared.push(task_id);
            }
        }
        for task_id in &disappeared {
            self.processes.remove(task_id);
            self.threads.remove(task_id);
            self.targets_status.remove(task_id);
        }
        disappeared
    }
}
