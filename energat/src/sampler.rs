//! The high-rate sampler: a dedicated OS thread that, at `rapl_period`
//! cadence, records which socket every tracked task is currently scheduled
//! on and samples system-wide and per-task NUMA memory usage. Grounded in
//! the same "background thread polling shared state under a mutex" shape as
//! the Python daemon thread (`sample_targets_status`), but implemented as a
//! real OS thread rather than relying on the GIL for safety.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;

use rapl_probes::numa::{read_private_numa_mem_mib, read_socket_numa_mem_mib, NumaMemKind};
use rapl_probes::proctime;
use rapl_probes::topology::Topology;

use crate::status_store::StatusStore;

pub fn spawn(
    store: Arc<Mutex<StatusStore>>,
    topology: Arc<Topology>,
    num_sockets: usize,
    period: Duration,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("energat-sampler".into())
        .spawn(move || run(store, topology, num_sockets, period, stop))
        .expect("failed to spawn sampler thread")
}

fn run(store: Arc<Mutex<StatusStore>>, topology: Arc<Topology>, num_sockets: usize, period: Duration, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match read_socket_numa_mem_mib(NumaMemKind::MemUsed, num_sockets) {
            Ok(server_used_mem) => tick(&store, &topology, &server_used_mem, num_sockets),
            Err(err) => warn!("sampler: failed to read system NUMA memory: {err:#}"),
        }
        std::thread::sleep(period);
    }
}

fn tick(store: &Mutex<StatusStore>, topology: &Topology, server_used_mem: &[f64], num_sockets: usize) {
    let mut store = store.lock().expect("status store mutex poisoned");

    for socket in 0..num_sockets {
        if let Some(samples) = store.server_numa_mem_samples.get_mut(socket) {
            samples.push(server_used_mem[socket]);
        }
    }

    let mut disappeared = Vec::new();
    let task_ids: Vec<i32> = store.targets_status.keys().copied().collect();
    for task_id in task_ids {
        if !proctime::task_exists(task_id) {
            warn!("(sampler) stopped tracing status of {task_id}");
            disappeared.push(task_id);
            continue;
        }

        let socket = proctime::task_socket(task_id, topology);
        let private_mem = read_private_numa_mem_mib(task_id, num_sockets);

        if let Some(status) = store.targets_status.get_mut(&task_id) {
            if let Some(socket) = socket {
                status.record_residence(socket);
            }
            status.record_numa_mem(&private_mem);
        }
    }

    for task_id in disappeared {
        store.processes.remove(&task_id);
        store.threads.remove(&task_id);
        store.targets_status.remove(&task_id);
    }
}
