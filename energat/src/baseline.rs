//! Idle (static) power estimation and persistence.
//!
//! A target cannot be traced until a baseline has been estimated (`energat
//! basepower`) or loaded from a prior run (`--basefile`): the attribution
//! engine subtracts this idle draw from every RAPL reading before ascribing
//! the remainder to tracked tasks.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use rapl_probes::numa::{read_socket_numa_mem_mib, NumaMemKind};
use rapl_probes::powercap::{PerSocketEnergy, RaplReader};
use rapl_probes::proctime;
use rapl_probes::topology::Topology;

use crate::error::EngineError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BaselineRecord {
    pkg_base_w: Vec<f64>,
    dram_base_w: Vec<f64>,
    pkg_base_percents: Vec<f64>,
    dram_base_percents: Vec<f64>,
}

/// Idle package/DRAM power per socket, plus the CPU/DRAM utilization
/// observed while it was estimated (used later to warn if the host is
/// currently busier than it was at estimation time).
#[derive(Debug, Clone)]
pub struct Baseline {
    pub num_sockets: usize,
    pub pkg_power_w: Vec<f64>,
    pub dram_power_w: Vec<f64>,
    pub pkg_percents: Vec<f64>,
    pub dram_percents: Vec<f64>,
    pub estimated: bool,
}

impl Baseline {
    pub fn empty(num_sockets: usize) -> Baseline {
        Baseline {
            num_sockets,
            pkg_power_w: vec![0.0; num_sockets],
            dram_power_w: vec![0.0; num_sockets],
            pkg_percents: vec![0.0; num_sockets],
            dram_percents: vec![0.0; num_sockets],
            estimated: false,
        }
    }

    /// Estimates idle package/DRAM power over `base_period`, by reading RAPL
    /// before and after the sleep and dividing by the elapsed duration.
    /// CPU utilization is taken from `/proc/stat` deltas over the same
    /// window; DRAM utilization from `numastat -m`.
    pub fn estimate(
        topology: &Topology,
        rapl: &mut RaplReader,
        base_period: Duration,
    ) -> Result<Baseline> {
        info!("estimating baseline power over {:.3}s...", base_period.as_secs_f64());
        let num_sockets = topology.num_sockets();

        let cputime_before = proctime::server_cputime_per_socket_sec(topology)?;
        let readings_before = rapl.read_joules()?;

        std::thread::sleep(base_period);

        let readings_after = rapl.read_joules()?;
        let cputime_after = proctime::server_cputime_per_socket_sec(topology)?;

        let duration_sec = base_period.as_secs_f64();
        let mut baseline = Baseline::empty(num_sockets);

        for socket in 0..num_sockets {
            baseline.pkg_power_w[socket] = (readings_after.pkg_j[socket] - readings_before.pkg_j[socket]) / duration_sec;
            baseline.dram_power_w[socket] = (readings_after.dram_j[socket] - readings_before.dram_j[socket]) / duration_sec;
        }

        let cores_per_socket = topology.cores_per_socket().max(1) as f64;
        for socket in 0..num_sockets {
            let busy_sec = cputime_after[socket] - cputime_before[socket];
            // utilization % = (cpu-seconds consumed across the socket's cores) / (wall seconds * cores).
            baseline.pkg_percents[socket] = 100.0 * busy_sec / (duration_sec * cores_per_socket);
        }

        let mem_used = read_socket_numa_mem_mib(NumaMemKind::MemUsed, num_sockets)?;
        let mem_total = read_socket_numa_mem_mib(NumaMemKind::MemTotal, num_sockets)?;
        for socket in 0..num_sockets {
            baseline.dram_percents[socket] = if mem_total[socket] > 0.0 {
                100.0 * mem_used[socket] / mem_total[socket]
            } else {
                0.0
            };
        }

        baseline.estimated = true;

        info!("baseline package power [W]: {:?}", baseline.pkg_power_w);
        info!("baseline DRAM power [W]:    {:?}", baseline.dram_power_w);
        info!("baseline package util [%]:  {:?}", baseline.pkg_percents);
        info!("baseline DRAM util [%]:     {:?}", baseline.dram_percents);

        if baseline.dram_percents.iter().all(|&p| p == 0.0) {
            error!("empty baseline memory usages!");
        }

        Ok(baseline)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let record = BaselineRecord {
            pkg_base_w: self.pkg_power_w.clone(),
            dram_base_w: self.dram_power_w.clone(),
            pkg_base_percents: self.pkg_percents.clone(),
            dram_base_percents: self.dram_percents.clone(),
        };
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
        }
        let file = std::fs::File::create(path).with_context(|| format!("creating {path}"))?;
        serde_json::to_writer(file, &record).context("writing baseline json")?;
        info!("baseline power saved at {path}");
        Ok(())
    }

    pub fn load(path: &str, num_sockets: usize) -> Result<Baseline> {
        if !Path::new(path).is_file() {
            return Err(EngineError::BaselineMissing { path: path.to_owned() }.into());
        }
        let file = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
        let record: BaselineRecord = serde_json::from_reader(file).context("parsing baseline json")?;

        Ok(Baseline {
            num_sockets,
            pkg_power_w: record.pkg_base_w,
            dram_power_w: record.dram_base_w,
            pkg_percents: record.pkg_base_percents,
            dram_percents: record.dram_base_percents,
            estimated: true,
        })
    }

    /// Energy, in Joules, the baseline would have consumed over `duration_sec`.
    pub fn energy_over(&self, duration_sec: f64) -> PerSocketEnergy {
        PerSocketEnergy {
            pkg_j: self.pkg_power_w.iter().map(|w| w * duration_sec).collect(),
            dram_j: self.dram_power_w.iter().map(|w| w * duration_sec).collect(),
        }
    }

    /// Compares current utilization against the utilization observed when
    /// the baseline was estimated, warning (not failing) if the host is now
    /// less busy than at estimation time — ascription accuracy degrades
    /// when idle draw is proportionally larger than it was calibrated for.
    pub fn check_utilization(&self, topology: &Topology, pkg_percents: &[f64], dram_percents: &[f64]) {
        for socket in 0..topology.num_sockets() {
            if pkg_percents[socket] < self.pkg_percents[socket] {
                warn!(
                    "socket {socket} CPU usage ({:.1}%) is below its baseline ({:.1}%); \
                     subsequent energy measurements may not be as accurate",
                    pkg_percents[socket], self.pkg_percents[socket]
                );
            }
            if dram_percents[socket] < self.dram_percents[socket] {
                warn!(
                    "socket {socket} DRAM usage ({:.1}%) is below its baseline ({:.1}%); \
                     subsequent energy measurements may not be as accurate",
                    dram_percents[socket], self.dram_percents[socket]
                );
            }
        }
    }
}

/// Reads current per-socket CPU/DRAM utilization percentages, in the same
/// units `Baseline::estimate` computed them in, for use in
/// `Baseline::check_utilization`.
pub fn current_utilization(
    topology: &Topology,
    cputime_before: &[f64],
    cputime_now: &[f64],
    duration_sec: f64,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let cores_per_socket = topology.cores_per_socket().max(1) as f64;
    let num_sockets = topology.num_sockets();

    let mut pkg_percents = vec![0.0; num_sockets];
    for socket in 0..num_sockets {
        let busy_sec = cputime_now[socket] - cputime_before[socket];
        pkg_percents[socket] = 100.0 * busy_sec / (duration_sec * cores_per_socket);
    }

    let mem_used = read_socket_numa_mem_mib(NumaMemKind::MemUsed, num_sockets)?;
    let mem_total = read_socket_numa_mem_mib(NumaMemKind::MemTotal, num_sockets)?;
    let mut dram_percents = vec![0.0; num_sockets];
    for socket in 0..num_sockets {
        dram_percents[socket] = if mem_total[socket] > 0.0 {
            100.0 * mem_used[socket] / mem_total[socket]
        } else {
            0.0
        };
    }

    Ok((pkg_percents, dram_percents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_over_scales_power_by_duration() {
        let baseline = Baseline {
            num_sockets: 2,
            pkg_power_w: vec![10.0, 20.0],
            dram_power_w: vec![1.0, 2.0],
            pkg_percents: vec![0.0, 0.0],
            dram_percents: vec![0.0, 0.0],
            estimated: true,
        };
        let energy = baseline.energy_over(2.0);
        assert_eq!(energy.pkg_j, vec![20.0, 40.0]);
        assert_eq!(energy.dram_j, vec![2.0, 4.0]);
    }
}
