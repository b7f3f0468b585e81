//! Per-task and system-wide CPU time, read via `procfs` instead of hand-
//! parsing `/proc/<pid>/task/<tid>/stat` (the teacher already pulls in
//! `procfs` for `cli_poll_rapl`; we actually exercise it here).

use log::warn;

use crate::topology::Topology;

/// Returns `true` if the given task (pid or tid) still has a `/proc` entry.
pub fn task_exists(task_id: i32) -> bool {
    procfs::process::Process::new(task_id).is_ok()
}

/// Reads the user+kernel CPU time of a single kernel task (pid or tid), in
/// seconds. We deliberately go through `Process::new(tid)` rather than
/// `Process::tasks()` so that callers can address a bare task id directly;
/// `/proc/<tid>/stat` for a thread reports that thread's own time, not the
/// aggregate of its thread group (see `man 5 proc`, fields utime/stime).
///
/// Returns `0.0`, with a warning, if the task has gone.
pub fn read_task_cputime_sec(task_id: i32) -> f64 {
    match procfs::process::Process::new(task_id).and_then(|p| p.stat()) {
        Ok(stat) => {
            let ticks = stat.utime + stat.stime;
            ticks as f64 / ticks_per_second()
        }
        Err(_) => {
            warn!("task {task_id} has gone");
            0.0
        }
    }
}

/// Reads the core a task is currently (or was last) scheduled on, translated
/// to a socket id via `topology`. Returns `None` if the task has gone.
pub fn task_socket(task_id: i32, topology: &Topology) -> Option<u32> {
    let stat = procfs::process::Process::new(task_id).and_then(|p| p.stat()).ok()?;
    let core = stat.processor? as u32;
    topology.socket_of(core)
}

/// Returns `true` if the root task exists and is neither a zombie nor dead.
pub fn task_is_live(task_id: i32) -> bool {
    match procfs::process::Process::new(task_id).and_then(|p| p.stat()) {
        Ok(stat) => !matches!(stat.state, 'Z' | 'X'),
        Err(_) => false,
    }
}

/// Sums per-CPU user+system time (from `/proc/stat`) by socket, in seconds.
pub fn server_cputime_per_socket_sec(topology: &Topology) -> anyhow::Result<Vec<f64>> {
    let kernel_stats = procfs::KernelStats::new()?;
    let tps = ticks_per_second();
    let mut per_socket = vec![0.0f64; topology.num_sockets()];

    for (core, cpu_time) in kernel_stats.cpu_time.iter().enumerate() {
        let Some(socket) = topology.socket_of(core as u32) else {
            continue;
        };
        let ticks = cpu_time.user + cpu_time.system;
        per_socket[socket as usize] += ticks as f64 / tps;
    }

    Ok(per_socket)
}

fn ticks_per_second() -> f64 {
    procfs::ticks_per_second() as f64
}

#[cfg(test)]
mod tests {
    use super::task_exists;

    #[test]
    fn pid_1_exists_on_any_running_linux_host() {
        // init/systemd is always pid 1 on a live Linux system; absent in
        // some sandboxes, so we only assert the call itself doesn't panic.
        let _ = task_exists(1);
    }
}
