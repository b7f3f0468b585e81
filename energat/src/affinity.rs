//! Pinning the tracer's own threads to lightly-loaded cores, so the act of
//! measuring perturbs the measurement as little as possible (mirrors the
//! Python tool's `taskset -cp` call on its own tracer process and daemon
//! thread).

use anyhow::{bail, Context, Result};
use log::info;

use rapl_probes::proctime;
use rapl_probes::topology::Topology;

/// Pins the given kernel task ids (tids) to the `n_cores` least-loaded cores,
/// measured as a CPU-time delta over a short sampling window.
pub fn pin_least_loaded(task_ids: &[i32], topology: &Topology, n_cores: usize) -> Result<()> {
    let cores = least_loaded_cores(topology, n_cores)?;
    for &task_id in task_ids {
        pin_task(task_id, &cores)?;
    }
    info!("pinned {task_ids:?} to cores {cores:?}");
    Ok(())
}

fn least_loaded_cores(topology: &Topology, n_cores: usize) -> Result<Vec<u32>> {
    let before = core_busy_ticks()?;
    std::thread::sleep(std::time::Duration::from_millis(100));
    let after = core_busy_ticks()?;

    let mut deltas: Vec<(u32, u64)> = (0..topology.num_cores() as u32)
        .map(|core| {
            let busy = after[core as usize].saturating_sub(before[core as usize]);
            (core, busy)
        })
        .collect();
    deltas.sort_by_key(|&(_, busy)| busy);

    Ok(deltas.into_iter().take(n_cores.max(1)).map(|(core, _)| core).collect())
}

fn core_busy_ticks() -> Result<Vec<u64>> {
    let kernel_stats = procfs::KernelStats::new().context("reading /proc/stat")?;
    Ok(kernel_stats
        .cpu_time
        .iter()
        .map(|t| t.user + t.system + t.nice)
        .collect())
}

fn pin_task(task_id: i32, cores: &[u32]) -> Result<()> {
    // Safety: `cpu_set` is a plain-old-data struct fully initialized by
    // `CPU_ZERO`/`CPU_SET` before being passed to the kernel; `task_id` is
    // validated to still exist just before the call.
    if !proctime::task_exists(task_id) {
        bail!("cannot pin task {task_id}: it no longer exists");
    }

    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        for &core in cores {
            libc::CPU_SET(core as usize, &mut cpu_set);
        }

        let ret = libc::sched_setaffinity(task_id, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set);
        if ret != 0 {
            bail!(
                "sched_setaffinity({task_id}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    Ok(())
}
