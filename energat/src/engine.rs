//! The Attribution Engine: at every `interval`, reads the RAPL package/DRAM
//! counters, subtracts baseline (idle) power, and ascribes the remainder to
//! the tracked task set using the non-linear credit model. Runs on its own
//! OS thread with a dedicated single-threaded Tokio runtime so it can use
//! `tokio_timerfd::Interval` for high-precision pacing — the same reason
//! the teacher's `cli_poll_rapl` reaches for that crate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use log::{info, warn};
use tokio_timerfd::Interval;

use rapl_probes::powercap::{PerSocketEnergy, RaplReader};
use rapl_probes::proctime;
use rapl_probes::topology::Topology;

use crate::baseline::{current_utilization, Baseline};
use crate::config::Config;
use crate::sink::{Record, SinkHandle};
use crate::status_store::StatusStore;
use crate::target::TargetStatus;
use crate::targetset::TargetSetManager;

const SMALL_CONST: f64 = 1e-5;

/// Runs the engine loop on a dedicated OS thread pinned via `sched_setaffinity`,
/// blocking the calling thread until `stop` is observed or the target exits.
pub fn run_on_dedicated_thread(
    root_pid: i32,
    topology: Arc<Topology>,
    store: Arc<Mutex<StatusStore>>,
    baseline: Baseline,
    config: Config,
    sink: SinkHandle,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<Result<()>> {
    std::thread::Builder::new()
        .name("energat-engine".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("building engine runtime")?;
            runtime.block_on(run(root_pid, topology, store, baseline, config, sink, stop))
        })
        .expect("failed to spawn engine thread")
}

async fn run(
    root_pid: i32,
    topology: Arc<Topology>,
    store: Arc<Mutex<StatusStore>>,
    baseline: Baseline,
    config: Config,
    sink: SinkHandle,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let num_sockets = topology.num_sockets();
    let tracer_process_pid = std::process::id() as i32;
    let tracer_thread_tid = current_tid();

    let hierarchy = rapl_probes::powercap::all_power_zones().context("discovering RAPL zones")?;
    let mut rapl = RaplReader::open(&hierarchy, num_sockets).map_err(crate::error::EngineError::from_rapl_open)?;
    let max_energy = rapl.max_joules();

    let targetset = TargetSetManager::new(root_pid, tracer_process_pid, tracer_thread_tid);

    let mut ts_before = Instant::now();
    let mut readings_before = rapl.read_joules()?;
    let mut server_cputime_before = proctime::server_cputime_per_socket_sec(&topology)?;

    match targetset.discover()? {
        Some(targets) => store.lock().expect("poisoned").reset_for_interval(targets),
        None => {
            warn!("no active targets at startup");
            return Ok(());
        }
    }

    let mut interval = Interval::new_interval(config.interval).context("creating engine interval timer")?;

    loop {
        interval.next().await;

        if stop.load(Ordering::Relaxed) {
            break;
        }

        let target_loop_deadline = ts_before + config.interval;
        let now = Instant::now();
        if now > target_loop_deadline {
            warn!(
                "one lap exceeded the configured interval by {:.3}s",
                (now - target_loop_deadline).as_secs_f64()
            );
        }

        let readings_now = rapl.read_joules()?;
        let ts_now = Instant::now();
        let duration_sec = (ts_now - ts_before).as_secs_f64();

        let total_energy = subtract_with_overflow(&readings_before, &readings_now, &max_energy);

        // Record CPU time deltas for every tracked task before they can be
        // removed by the sampler (lock ordering matches the Python tracer:
        // cputime recording happens-before target-set refresh each interval).
        {
            let mut store = store.lock().expect("poisoned");
            store.record_cputime();
        }
        let server_cputime_now = proctime::server_cputime_per_socket_sec(&topology)?;
        let total_server_cputime: Vec<f64> = server_cputime_now
            .iter()
            .zip(&server_cputime_before)
            .map(|(now, before)| now - before)
            .collect();

        let (pkg_percents, dram_percents) =
            current_utilization(&topology, &server_cputime_before, &server_cputime_now, duration_sec)?;
        baseline.check_utilization(&topology, &pkg_percents, &dram_percents);

        let base_energy = baseline.energy_over(duration_sec);
        let delta_energy = clamp_non_negative(&total_energy, &base_energy);

        let (ascription, num_proc, num_threads) = {
            let store = store.lock().expect("poisoned");
            let ascription = ascribe_energy(
                num_sockets,
                config.gamma,
                config.delta,
                &delta_energy,
                &total_server_cputime,
                &store.server_numa_mem_samples,
                &store.targets_status,
                &store.threads,
                tracer_process_pid,
                tracer_thread_tid,
            );
            (ascription, store.processes.len(), store.threads.len())
        };

        let targets_alive = match targetset.discover()? {
            Some(targets) => {
                store.lock().expect("poisoned").reset_for_interval(targets);
                true
            }
            None => false,
        };

        let time_unix = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        // Matches the Python tracer's `round(time.time()) % FLAGS.logging == 0`
        // gate: at --loglvl=debug, periodically echo the credit fractions
        // without spamming a line every single interval.
        let debug_logging_due = config.logging_period_sec > 0 && time_unix.round() as u64 % config.logging_period_sec == 0;

        for socket in 0..num_sockets {
            if debug_logging_due {
                log::debug!(
                    "socket={socket}: cpu_credit_frac={:.3}, dram_credit_frac={:.3}",
                    ascription.pkg_credit_frac[socket],
                    ascription.dram_credit_frac[socket],
                );
            }

            let record = Record {
                time_unix,
                socket: socket as u32,
                duration_sec,
                num_proc,
                num_threads,
                pkg_credit_frac: ascription.pkg_credit_frac[socket],
                dram_credit_frac: ascription.dram_credit_frac[socket],
                total_pkg_joules: total_energy.pkg_j[socket],
                total_dram_joules: total_energy.dram_j[socket],
                base_pkg_joules: base_energy.pkg_j[socket],
                base_dram_joules: base_energy.dram_j[socket],
                ascribed_pkg_joules: ascription.ascribed_pkg_j[socket],
                ascribed_dram_joules: ascription.ascribed_dram_j[socket],
                tracer_pkg_joules: ascription.tracer_pkg_j[socket],
                tracer_dram_joules: ascription.tracer_dram_j[socket],
                pkg_percent: pkg_percents[socket],
                dram_percent: dram_percents[socket],
            };
            sink.send(record).await?;
        }

        if !targets_alive || stop.load(Ordering::Relaxed) {
            sink.flush().await?;
            info!("tracer stopped; target alive = {targets_alive}");
            break;
        }

        server_cputime_before = server_cputime_now;
        readings_before = readings_now;
        ts_before = ts_now;
    }

    Ok(())
}

/// Computes the per-socket, per-domain energy delta between two raw RAPL
/// snapshots. A reading lower than the previous one indicates the 32-bit
/// counter wrapped; rather than reconstruct the true consumption across the
/// wrap (which would need to know how many times it wrapped), this credits
/// exactly one full range and discards whatever was consumed before the
/// wrap — a deliberate, known source of under-counting during overflow.
fn subtract_with_overflow(before: &PerSocketEnergy, now: &PerSocketEnergy, max_range: &PerSocketEnergy) -> PerSocketEnergy {
    let mut overflowed = false;

    let pkg_j = before
        .pkg_j
        .iter()
        .zip(&now.pkg_j)
        .zip(&max_range.pkg_j)
        .map(|((b, n), max)| {
            let diff = n - b;
            if diff < 0.0 {
                overflowed = true;
                *max
            } else {
                diff
            }
        })
        .collect();

    let dram_j = before
        .dram_j
        .iter()
        .zip(&now.dram_j)
        .zip(&max_range.dram_j)
        .map(|((b, n), max)| {
            let diff = n - b;
            if diff < 0.0 {
                overflowed = true;
                *max
            } else {
                diff
            }
        })
        .collect();

    if overflowed {
        warn!("negative energy reading occurred -> RAPL counter wrapped, crediting max range for the affected socket(s)");
    }

    PerSocketEnergy { pkg_j, dram_j }
}

fn clamp_non_negative(total: &PerSocketEnergy, base: &PerSocketEnergy) -> PerSocketEnergy {
    let mut went_negative = false;

    let clamp = |t: f64, b: f64, went_negative: &mut bool| {
        let d = t - b;
        if d < 0.0 {
            *went_negative = true;
            0.0
        } else {
            d
        }
    };

    let pkg_j = total
        .pkg_j
        .iter()
        .zip(&base.pkg_j)
        .map(|(&t, &b)| clamp(t, b, &mut went_negative))
        .collect();
    let dram_j = total
        .dram_j
        .iter()
        .zip(&base.dram_j)
        .map(|(&t, &b)| clamp(t, b, &mut went_negative))
        .collect();

    if went_negative {
        warn!("total energy less than baseline energy; clamping to 0");
    }

    PerSocketEnergy { pkg_j, dram_j }
}

/// Ascribes this interval's (already baseline-subtracted) energy to the
/// tracked task set, separately totaling the tracer's own overhead.
pub struct AscriptionOutput {
    pub ascribed_pkg_j: Vec<f64>,
    pub ascribed_dram_j: Vec<f64>,
    pub tracer_pkg_j: Vec<f64>,
    pub tracer_dram_j: Vec<f64>,
    pub pkg_credit_frac: Vec<f64>,
    pub dram_credit_frac: Vec<f64>,
}

#[allow(clippy::too_many_arguments)]
pub fn ascribe_energy(
    num_sockets: usize,
    gamma: f64,
    delta: f64,
    delta_energy: &PerSocketEnergy,
    total_server_cputime_sec: &[f64],
    server_mem_samples: &[Vec<f64>],
    targets_status: &HashMap<i32, TargetStatus>,
    threads: &HashMap<i32, i32>,
    tracer_process_pid: i32,
    tracer_thread_tid: i32,
) -> AscriptionOutput {
    let mut ascribable_cputime = vec![0.0; num_sockets];
    let mut tracer_cputime = vec![0.0; num_sockets];

    let mut group_members: HashMap<i32, Vec<i32>> = HashMap::new();
    for (&tid, &gpid) in threads {
        group_members.entry(gpid).or_default().push(tid);
    }

    let num_mem_samples = targets_status
        .values()
        .filter_map(|s| s.numa_mem_samples.first().map(|v| v.len()))
        .max()
        .unwrap_or(0);

    let mut accumulated_private_mem = vec![vec![0.0f64; num_mem_samples]; num_sockets];
    let mut tracer_mem = vec![vec![0.0f64; num_mem_samples]; num_sockets];

    let mut ascribed_threads: HashSet<i32> = HashSet::new();
    let is_tracer = |task_id: i32| task_id == tracer_process_pid || task_id == tracer_thread_tid;

    for (&task_id, status) in targets_status {
        // §4.3: a task the sampler never got a tick for has no residency
        // information to ascribe against and is dropped for this interval,
        // rather than credited with a fabricated uniform distribution.
        if !status.was_sampled() {
            continue;
        }

        let probs = status.compute_socket_residence_probs(num_sockets);
        for socket in 0..num_sockets {
            let cputime = status.cpu_time_delta_sec * probs.get(socket).copied().unwrap_or(0.0);
            if is_tracer(task_id) {
                tracer_cputime[socket] += cputime;
            } else {
                ascribable_cputime[socket] += cputime;
            }
        }

        let is_thread = threads.contains_key(&task_id);
        if is_thread && ascribed_threads.contains(&task_id) {
            continue;
        }

        for socket in 0..num_sockets {
            let Some(samples) = status.numa_mem_samples.get(socket) else { continue };
            for (i, &v) in samples.iter().enumerate().take(num_mem_samples) {
                if is_tracer(task_id) {
                    tracer_mem[socket][i] += v;
                } else {
                    accumulated_private_mem[socket][i] += v;
                }
            }
        }

        if is_thread {
            if let Some(gpid) = threads.get(&task_id) {
                if let Some(siblings) = group_members.get(gpid) {
                    ascribed_threads.extend(siblings.iter().copied());
                }
            }
        }
    }

    let mut out = AscriptionOutput {
        ascribed_pkg_j: vec![0.0; num_sockets],
        ascribed_dram_j: vec![0.0; num_sockets],
        tracer_pkg_j: vec![0.0; num_sockets],
        tracer_dram_j: vec![0.0; num_sockets],
        pkg_credit_frac: vec![0.0; num_sockets],
        dram_credit_frac: vec![0.0; num_sockets],
    };

    for socket in 0..num_sockets {
        let cpu_energy = delta_energy.pkg_j[socket];
        let dram_energy = delta_energy.dram_j[socket];
        let server_cputime = total_server_cputime_sec.get(socket).copied().unwrap_or(0.0);

        let cpu_credit_frac = if server_cputime > 0.0 {
            (ascribable_cputime[socket] / server_cputime).min(1.0)
        } else {
            SMALL_CONST
        };
        out.ascribed_pkg_j[socket] = cpu_energy * cpu_credit_frac.powf(gamma);
        out.pkg_credit_frac[socket] = cpu_credit_frac;

        let mut server_samples = server_mem_samples.get(socket).cloned().unwrap_or_default();
        server_samples.resize(num_mem_samples, 0.0);
        let mut private_samples = accumulated_private_mem[socket].clone();
        let mut tracer_samples = tracer_mem[socket].clone();
        for i in 0..num_mem_samples {
            if server_samples[i] == 0.0 {
                server_samples[i] = SMALL_CONST;
                private_samples[i] = SMALL_CONST;
                tracer_samples[i] = SMALL_CONST;
            }
        }

        let mem_credit_frac = mean_ratio(&private_samples, &server_samples).min(1.0);
        out.ascribed_dram_j[socket] = dram_energy * mem_credit_frac.powf(delta);
        out.dram_credit_frac[socket] = mem_credit_frac;

        let tracer_cpu_frac = if server_cputime > 0.0 {
            (tracer_cputime[socket] / server_cputime).min(1.0)
        } else {
            0.0
        };
        out.tracer_pkg_j[socket] = cpu_energy * tracer_cpu_frac.powf(gamma);

        let tracer_mem_frac = mean_ratio(&tracer_samples, &server_samples).min(1.0);
        out.tracer_dram_j[socket] = dram_energy * tracer_mem_frac.powf(delta);
    }

    out
}

fn mean_ratio(numer: &[f64], denom: &[f64]) -> f64 {
    let n = numer.len().min(denom.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = (0..n).map(|i| numer[i] / denom[i]).sum();
    sum / n as f64
}

fn current_tid() -> i32 {
    // SAFETY: gettid(2) has no preconditions and cannot fail on Linux.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_with(task_id: i32, cpu_delta: f64, residence: Vec<u64>, mem: Vec<Vec<f64>>) -> TargetStatus {
        TargetStatus {
            task_id,
            last_cpu_time_sec: 0.0,
            cpu_time_delta_sec: cpu_delta,
            socket_residence_counts: residence,
            numa_mem_samples: mem,
        }
    }

    #[test]
    fn credit_fractions_stay_within_unit_interval() {
        let mut targets = HashMap::new();
        targets.insert(1, status_with(1, 0.5, vec![10], vec![vec![5.0, 5.0]]));
        targets.insert(2, status_with(2, 2.0, vec![10], vec![vec![2.0, 2.0]]));

        let delta_energy = PerSocketEnergy {
            pkg_j: vec![100.0],
            dram_j: vec![50.0],
        };
        let server_mem_samples = vec![vec![10.0, 10.0]];
        let threads = HashMap::new();

        let out = ascribe_energy(
            1,
            0.3,
            0.2,
            &delta_energy,
            &[1.0],
            &server_mem_samples,
            &targets,
            &threads,
            999,
            998,
        );

        assert!(out.pkg_credit_frac[0] >= 0.0 && out.pkg_credit_frac[0] <= 1.0);
        assert!(out.dram_credit_frac[0] >= 0.0 && out.dram_credit_frac[0] <= 1.0);
        assert!(out.ascribed_pkg_j[0] >= 0.0 && out.ascribed_pkg_j[0] <= delta_energy.pkg_j[0]);
        assert!(out.ascribed_dram_j[0] >= 0.0 && out.ascribed_dram_j[0] <= delta_energy.dram_j[0]);
    }

    #[test]
    fn thread_siblings_are_deduped_for_memory_but_not_cpu() {
        // two threads of the same group: each contributes its own cpu time,
        // but only one contributes to the DRAM/memory accumulation.
        let mut targets = HashMap::new();
        targets.insert(10, status_with(10, 1.0, vec![5], vec![vec![3.0]]));
        targets.insert(11, status_with(11, 1.0, vec![5], vec![vec![3.0]]));

        let mut threads = HashMap::new();
        threads.insert(10, 10);
        threads.insert(11, 10);

        let delta_energy = PerSocketEnergy {
            pkg_j: vec![100.0],
            dram_j: vec![40.0],
        };
        let server_mem_samples = vec![vec![6.0]];

        let out = ascribe_energy(
            1,
            0.3,
            0.2,
            &delta_energy,
            &[2.0],
            &server_mem_samples,
            &targets,
            &threads,
            999,
            998,
        );

        // cpu credit reflects both threads' time (2.0s out of 2.0s server time == full credit)
        assert!((out.pkg_credit_frac[0] - 1.0).abs() < 1e-9);
        // dram credit reflects only one thread's 3.0 MiB out of 6.0 MiB, not 6.0/6.0
        assert!((out.dram_credit_frac[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn no_targets_yields_zero_ascription() {
        let targets = HashMap::new();
        let threads = HashMap::new();
        let delta_energy = PerSocketEnergy {
            pkg_j: vec![100.0],
            dram_j: vec![40.0],
        };
        let out = ascribe_energy(1, 0.3, 0.2, &delta_energy, &[1.0], &[vec![]], &targets, &threads, 999, 998);
        assert_eq!(out.ascribed_pkg_j, vec![0.0]);
        assert_eq!(out.ascribed_dram_j, vec![0.0]);
    }

    #[test]
    fn task_with_no_residence_samples_is_dropped_not_ascribed() {
        // a task inserted by `reset_for_interval` late in the interval, never
        // reached by a sampler tick before ascription runs, must contribute
        // nothing — not a fabricated uniform residency split (§4.3).
        let mut targets = HashMap::new();
        targets.insert(1, status_with(1, 1.0, vec![5, 5], vec![vec![10.0], vec![10.0]]));
        targets.insert(2, status_with(2, 1.0, vec![0, 0], vec![Vec::new(), Vec::new()]));

        let delta_energy = PerSocketEnergy {
            pkg_j: vec![100.0, 100.0],
            dram_j: vec![40.0, 40.0],
        };
        let server_mem_samples = vec![vec![20.0], vec![20.0]];
        let threads = HashMap::new();

        let with_unsampled = ascribe_energy(
            2,
            0.3,
            0.2,
            &delta_energy,
            &[2.0, 2.0],
            &server_mem_samples,
            &targets,
            &threads,
            999,
            998,
        );

        targets.remove(&2);
        let without_unsampled = ascribe_energy(
            2,
            0.3,
            0.2,
            &delta_energy,
            &[2.0, 2.0],
            &server_mem_samples,
            &targets,
            &threads,
            999,
            998,
        );

        assert_eq!(with_unsampled.ascribed_pkg_j, without_unsampled.ascribed_pkg_j);
        assert_eq!(with_unsampled.ascribed_dram_j, without_unsampled.ascribed_dram_j);
        assert_eq!(with_unsampled.pkg_credit_frac, without_unsampled.pkg_credit_frac);
    }

    #[test]
    fn overflow_credits_max_range_not_reconstructed_consumption() {
        let before = PerSocketEnergy {
            pkg_j: vec![90.0],
            dram_j: vec![5.0],
        };
        let now = PerSocketEnergy {
            pkg_j: vec![10.0], // wrapped
            dram_j: vec![7.0],
        };
        let max_range = PerSocketEnergy {
            pkg_j: vec![120.0],
            dram_j: vec![50.0],
        };
        let result = subtract_with_overflow(&before, &now, &max_range);
        assert_eq!(result.pkg_j[0], 120.0);
        assert_eq!(result.dram_j[0], 2.0);
    }

    #[test]
    fn baseline_above_total_clamps_to_zero() {
        let total = PerSocketEnergy {
            pkg_j: vec![5.0],
            dram_j: vec![1.0],
        };
        let base = PerSocketEnergy {
            pkg_j: vec![10.0],
            dram_j: vec![0.5],
        };
        let clamped = clamp_non_negative(&total, &base);
        assert_eq!(clamped.pkg_j[0], 0.0);
        assert_eq!(clamped.dram_j[0], 0.5);
    }
}
