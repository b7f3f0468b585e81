//! Core-to-socket topology discovery.
//!
//! The rest of the platform probe (RAPL, NUMA, per-task CPU time) is keyed by
//! socket id, but the kernel only exposes a per-core `physical_package_id`.
//! [`Topology`] is read once at startup and shared read-only for the lifetime
//! of the process.

use std::collections::HashMap;
use std::fs;

use anyhow::Context;

/// An immutable core -> socket mapping, keyed by core id. A `HashMap` rather
/// than a `Vec` indexed by core id: the online-CPU list
/// (`crate::online_cpus`/`parse_cpu_list`) is explicitly allowed to be
/// non-contiguous (e.g. `"1-3,5-6"`), so a core id is not a safe index into a
/// `Vec` sized by the *count* of online cores.
#[derive(Debug, Clone)]
pub struct Topology {
    core_socket: HashMap<u32, u32>,
    num_sockets: usize,
}

impl Topology {
    /// Reads `/sys/devices/system/cpu/cpu<N>/topology/physical_package_id` for
    /// every online core and builds the core -> socket map.
    pub fn discover() -> anyhow::Result<Topology> {
        let cores = crate::online_cpus().context("listing online cpus")?;
        let mut core_socket = HashMap::with_capacity(cores.len());
        let mut sockets = std::collections::HashSet::new();

        for &core in &cores {
            let path = format!("/sys/devices/system/cpu/cpu{core}/topology/physical_package_id");
            let content =
                fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            let socket: u32 = content
                .trim_end()
                .parse()
                .with_context(|| format!("parsing physical_package_id from {path}"))?;
            core_socket.insert(core, socket);
            sockets.insert(socket);
        }

        Ok(Topology {
            core_socket,
            num_sockets: sockets.len(),
        })
    }

    /// Number of cores tracked by this topology.
    pub fn num_cores(&self) -> usize {
        self.core_socket.len()
    }

    /// Number of distinct CPU sockets (packages).
    pub fn num_sockets(&self) -> usize {
        self.num_sockets
    }

    /// Number of cores per socket, assuming a uniform distribution (the spec's
    /// stated assumption).
    pub fn cores_per_socket(&self) -> usize {
        if self.num_sockets == 0 {
            0
        } else {
            self.num_cores() / self.num_sockets
        }
    }

    /// Maps a core id to its socket id, or `None` if `core` isn't a known
    /// (online) core — never panics on an out-of-range or offline id.
    pub fn socket_of(&self, core: u32) -> Option<u32> {
        self.core_socket.get(&core).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::Topology;

    #[test]
    fn cores_per_socket_is_even_split() {
        let topo = Topology {
            core_socket: [(0, 0), (1, 0), (2, 1), (3, 1)].into_iter().collect(),
            num_sockets: 2,
        };
        assert_eq!(topo.cores_per_socket(), 2);
        assert_eq!(topo.socket_of(2), Some(1));
    }

    #[test]
    fn non_contiguous_core_ids_do_not_panic() {
        let topo = Topology {
            core_socket: [(1, 0), (2, 0), (3, 0), (5, 1), (6, 1)].into_iter().collect(),
            num_sockets: 2,
        };
        assert_eq!(topo.num_cores(), 5);
        assert_eq!(topo.socket_of(6), Some(1));
        assert_eq!(topo.socket_of(4), None);
    }
}
