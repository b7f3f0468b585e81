//! Discovers the full set of tasks (processes and threads) descending from
//! the root target pid, replacing Python's `psutil.Process.children(recursive=True)`
//! with a manual `/proc` scan: `procfs` has no equivalent tree-walk helper.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use log::{info, warn};

use rapl_probes::proctime;

#[derive(Debug, Default, Clone)]
pub struct Targets {
    pub processes: HashSet<i32>,
    /// tid -> owning thread-group (process) pid.
    pub threads: HashMap<i32, i32>,
}

impl Targets {
    fn task_ids(&self) -> HashSet<i32> {
        self.processes.iter().copied().chain(self.threads.keys().copied()).collect()
    }
}

pub struct TargetSetManager {
    root_pid: i32,
    tracer_process_pid: i32,
    tracer_thread_tid: i32,
    /// Task ids seen on the previous `discover()` call, used only to log
    /// additions/removals; never consulted to decide the new set itself, so
    /// calling `discover()` twice back to back with no process-tree changes
    /// still produces identical `Targets`.
    previous: Mutex<Option<HashSet<i32>>>,
}

impl TargetSetManager {
    pub fn new(root_pid: i32, tracer_process_pid: i32, tracer_thread_tid: i32) -> TargetSetManager {
        TargetSetManager {
            root_pid,
            tracer_process_pid,
            tracer_thread_tid,
            previous: Mutex::new(None),
        }
    }

    /// Rebuilds the target set. Returns `Ok(None)` if the root target has
    /// exited cleanly (no active targets) — this is not a fatal condition,
    /// it signals the engine loop to wind down.
    pub fn discover(&self) -> anyhow::Result<Option<Targets>> {
        if !proctime::task_exists(self.root_pid) {
            warn!("target application ({}) appears to have exited", self.root_pid);
            return Ok(None);
        }
        if !proctime::task_is_live(self.root_pid) {
            anyhow::bail!(crate::error::EngineError::TargetGone { pid: self.root_pid });
        }

        let mut processes = HashSet::new();
        let mut threads = HashMap::new();

        classify(self.root_pid, &mut processes, &mut threads);

        for pid in descendants(self.root_pid) {
            if !proctime::task_is_live(pid) {
                warn!("descendant {pid} is not live, skipping");
                continue;
            }
            classify(pid, &mut processes, &mut threads);
        }

        if processes.is_empty() && threads.is_empty() {
            warn!("no active targets found");
            return Ok(None);
        }

        // Always track the tracer's own process and engine thread explicitly,
        // in case they are not descendants of the target (attach mode).
        processes.insert(self.tracer_process_pid);
        threads.insert(self.tracer_thread_tid, self.tracer_process_pid);

        let targets = Targets { processes, threads };
        self.log_diff(&targets);

        Ok(Some(targets))
    }

    /// Logs which task ids were added/removed since the last `discover()`
    /// call, suppressing the tracer's own ids from the "removed" noise (they
    /// are re-inserted every interval, so they'd otherwise never appear to
    /// leave even when genuinely gone, and seeing them churn is useless).
    fn log_diff(&self, targets: &Targets) {
        let current = targets.task_ids();
        let mut previous = self.previous.lock().expect("poisoned");

        if let Some(previous) = previous.as_ref() {
            for &added in current.difference(previous) {
                info!("added {added} to targets");
            }
            for &removed in previous.difference(&current) {
                if removed == self.tracer_process_pid || removed == self.tracer_thread_tid {
                    continue;
                }
                info!("removed {removed} from targets");
            }
        }

        *previous = Some(current);
    }
}

fn classify(pid: i32, processes: &mut HashSet<i32>, threads: &mut HashMap<i32, i32>) {
    let tids = match procfs::process::Process::new(pid).and_then(|p| p.tasks()) {
        Ok(tasks) => tasks.filter_map(|t| t.ok()).map(|t| t.tid).collect::<Vec<_>>(),
        Err(_) => return,
    };

    if tids.len() > 1 {
        for tid in tids {
            threads.insert(tid, pid);
        }
    } else {
        processes.insert(pid);
    }
}

/// Walks `/proc` once, building the full ppid tree, then returns every
/// descendant of `root` (not including `root` itself).
fn descendants(root: i32) -> Vec<i32> {
    let mut children_of: HashMap<i32, Vec<i32>> = HashMap::new();

    let Ok(procs) = procfs::process::all_processes() else {
        return Vec::new();
    };
    for proc in procs.flatten() {
        if let Ok(stat) = proc.stat() {
            children_of.entry(stat.ppid).or_default().push(stat.pid);
        }
    }

    let mut out = Vec::new();
    let mut stack = children_of.get(&root).cloned().unwrap_or_default();
    while let Some(pid) = stack.pop() {
        out.push(pid);
        if let Some(kids) = children_of.get(&pid) {
            stack.extend(kids.iter().copied());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_unions_processes_and_threads() {
        let targets = Targets {
            processes: [1, 2].into_iter().collect(),
            threads: [(10, 3), (11, 3)].into_iter().collect(),
        };
        let mut ids: Vec<i32> = targets.task_ids().into_iter().collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 10, 11]);
    }

    // Invoking `discover()` twice in succession with no process-tree changes
    // produces identical sets (testable property #6): the diff log is purely
    // observational side effect and never feeds back into the returned set.
    #[test]
    fn discover_is_idempotent_for_the_tracer_itself() {
        let own_pid = std::process::id() as i32;
        let own_tid = own_pid; // single-threaded test binary: tid == pid here is not guaranteed,
                                // but discover() always re-inserts tracer_process_pid/tracer_thread_tid
                                // regardless, so any placeholder tid exercises the same code path.
        let manager = TargetSetManager::new(own_pid, own_pid, own_tid);

        let first = manager.discover().expect("discover should succeed").expect("tracer process is alive");
        let second = manager.discover().expect("discover should succeed").expect("tracer process is alive");

        assert_eq!(first.processes, second.processes);
        assert_eq!(first.threads, second.threads);
    }
}
