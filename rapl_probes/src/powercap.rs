// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fmt::Display,
    fs::{self, File},
    io::{Read, Seek},
    path::{Path, PathBuf},
};

use anyhow::Context;

use super::RaplDomainType;

const POWERCAP_RAPL_PATH: &str = "/sys/class/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";
const POWERCAP_ENERGY_UNIT: f64 = 0.000_001; // 1 microJoule

/// A power zone.
#[derive(Debug)]
pub struct PowerZone {
    /// The name of the zone, as returned by powercap, for instance `package-0` or `dram`.
    pub name: String,

    /// The RAPL domain type, as an enum
    pub domain: RaplDomainType,

    /// The path of the zone in sysfs, for instance
    /// `/sys/class/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// Note that in the above path, `intel-rapl` is the "control type"
    /// and "intel-rapl:0" is the power zone. On most machines, that zone is
    /// named `package-0`.
    pub path: PathBuf,

    /// The sub-zones (can be empty).
    pub children: Vec<PowerZone>,

    /// The id of the socket that "contains" this zone, if applicable (psys has no zone)
    pub socket_id: Option<u32>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>, level: i8) -> std::fmt::Result {
        let mut indent = "  ".repeat(level as _);
        if level > 0 {
            indent.insert(0, '\n');
        }

        let powercap_name = &self.name;
        let domain = self.domain;
        let path = self.path.to_string_lossy();

        write!(f, "{indent}- {powercap_name} ({domain:?}) \t\t: {path}")?;
        for subzone in &self.children {
            subzone.fmt_rec(f, level + 1)?;
        }
        Ok(())
    }
}

impl Display for PowerZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f, 0)
    }
}

/// The full power-zone tree discovered under `POWERCAP_RAPL_PATH`.
pub struct PowerZoneHierarchy {
    pub top: Vec<PowerZone>,
}

impl PowerZoneHierarchy {
    /// Flattens the zone tree into a single list (depth-first, parents before children).
    pub fn flatten(&self) -> Vec<&PowerZone> {
        fn rec<'a>(zone: &'a PowerZone, out: &mut Vec<&'a PowerZone>) {
            out.push(zone);
            for child in &zone.children {
                rec(child, out);
            }
        }
        let mut out = Vec::new();
        for zone in &self.top {
            rec(zone, &mut out);
        }
        out
    }
}

/// Errors specific to discovering/validating the powercap RAPL hierarchy
/// against the topology the engine expects.
#[derive(Debug, thiserror::Error)]
pub enum PowercapError {
    #[error("RAPL package name mismatch: expected `package-{expected}`, found `{found}`")]
    NameMismatch { expected: u32, found: String },

    #[error("no powercap package zone found for socket {0}")]
    MissingSocket(u32),
}

/// Discovers all the RAPL power zones in the powercap sysfs.
pub fn all_power_zones() -> anyhow::Result<PowerZoneHierarchy> {
    fn parse_zone_name(name: &str) -> Option<RaplDomainType> {
        match name {
            "psys" => Some(RaplDomainType::Platform),
            "core" => Some(RaplDomainType::PP0),
            "uncore" => Some(RaplDomainType::PP1),
            "dram" => Some(RaplDomainType::Dram),
            _ if name.starts_with("package-") => Some(RaplDomainType::Package),
            _ => None,
        }
    }

    /// Recursively explore a power zone
    fn explore_rec(dir: &Path, parent_socket: Option<u32>) -> anyhow::Result<Vec<PowerZone>> {
        let mut zones = Vec::new();
        for e in fs::read_dir(dir)? {
            let entry = e?;
            let path = entry.path();
            let file_name = path.file_name().unwrap().to_string_lossy();

            if path.is_dir() && file_name.starts_with(POWER_ZONE_PREFIX) {
                let name_path = path.join("name");
                let name = fs::read_to_string(&name_path)?.trim().to_owned();
                let socket_id = {
                    if let Some(parent_id) = parent_socket {
                        Some(parent_id)
                    } else if let Some(id_str) = name.strip_prefix("package-") {
                        let id: u32 = id_str
                            .parse()
                            .with_context(|| format!("Failed to extract package id from '{name}'"))?;
                        Some(id)
                    } else {
                        None
                    }
                };
                let domain = parse_zone_name(&name).with_context(|| format!("Unknown RAPL powercap zone {name}"))?;
                let children = explore_rec(&path, socket_id)?; // recursively explore
                zones.push(PowerZone {
                    name,
                    domain,
                    path,
                    children,
                    socket_id,
                });
            }
        }
        zones.sort_by_key(|z| z.path.to_string_lossy().to_string());
        Ok(zones)
    }
    let top = explore_rec(Path::new(POWERCAP_RAPL_PATH), None)?;
    Ok(PowerZoneHierarchy { top })
}

/// A file handle opened on a single zone's `energy_uj`, plus its (immutable
/// for the process' lifetime) `max_energy_range_uj`.
struct OpenedZone {
    file: File,
    max_uj: u64,
}

fn open_zone(zone: &PowerZone) -> anyhow::Result<OpenedZone> {
    let file = File::open(zone.energy_path()).with_context(|| format!("opening {:?}", zone.energy_path()))?;
    let max_uj: u64 = fs::read_to_string(zone.max_energy_path())?
        .trim_end()
        .parse()
        .with_context(|| format!("parsing {:?}", zone.max_energy_path()))?;
    Ok(OpenedZone { file, max_uj })
}

fn read_uj(file: &mut File) -> anyhow::Result<u64> {
    file.rewind()?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    Ok(buf.trim_end().parse()?)
}

/// The package + DRAM-subdomain energy readings for every socket, in Joules.
/// `pkg_j[s]`/`dram_j[s]` is the reading for socket `s`.
#[derive(Debug, Clone)]
pub struct PerSocketEnergy {
    pub pkg_j: Vec<f64>,
    pub dram_j: Vec<f64>,
}

/// Reads the raw, cumulative RAPL package and DRAM-subdomain counters for
/// every socket, keeping file handles open across calls. Deltas and
/// overflow handling are the attribution engine's own responsibility (it
/// applies a specific, deliberately approximate wrap formula, see
/// `energat::engine`), so this reader never diffs or corrects anything
/// itself.
pub struct RaplReader {
    pkg: Vec<OpenedZone>,
    dram: Vec<Option<OpenedZone>>,
    num_sockets: usize,
}

impl RaplReader {
    /// Opens the package zone and (if present) its `dram` child for every
    /// socket `0..num_sockets`, verifying that each top-level zone is named
    /// `package-<s>` for its expected index.
    pub fn open(hierarchy: &PowerZoneHierarchy, num_sockets: usize) -> anyhow::Result<RaplReader> {
        let mut pkg = Vec::with_capacity(num_sockets);
        let mut dram = Vec::with_capacity(num_sockets);

        for socket in 0..num_sockets as u32 {
            let zone = hierarchy
                .top
                .iter()
                .find(|z| z.domain == RaplDomainType::Package && z.socket_id == Some(socket))
                .ok_or(PowercapError::MissingSocket(socket))?;

            let expected = format!("package-{socket}");
            if zone.name != expected {
                return Err(PowercapError::NameMismatch {
                    expected: socket,
                    found: zone.name.clone(),
                }
                .into());
            }

            pkg.push(open_zone(zone)?);

            let dram_zone = zone.children.iter().find(|c| c.domain == RaplDomainType::Dram);
            dram.push(dram_zone.map(open_zone).transpose()?);
        }

        Ok(RaplReader { pkg, dram, num_sockets })
    }

    /// Reads the current, absolute (not delta'd) joule readings for every socket.
    pub fn read_joules(&mut self) -> anyhow::Result<PerSocketEnergy> {
        let mut pkg_j = Vec::with_capacity(self.num_sockets);
        let mut dram_j = Vec::with_capacity(self.num_sockets);

        for zone in &mut self.pkg {
            let uj = read_uj(&mut zone.file)?;
            pkg_j.push(uj as f64 * POWERCAP_ENERGY_UNIT);
        }
        for zone in &mut self.dram {
            let uj = match zone {
                Some(z) => read_uj(&mut z.file)?,
                None => 0,
            };
            dram_j.push(uj as f64 * POWERCAP_ENERGY_UNIT);
        }

        Ok(PerSocketEnergy { pkg_j, dram_j })
    }

    /// The wrap-around ceiling for every socket, in Joules. Cached at `open` time:
    /// `max_energy_range_uj` is fixed for the lifetime of the zone.
    pub fn max_joules(&self) -> PerSocketEnergy {
        let pkg_j = self.pkg.iter().map(|z| z.max_uj as f64 * POWERCAP_ENERGY_UNIT).collect();
        let dram_j = self
            .dram
            .iter()
            .map(|z| z.as_ref().map(|z| z.max_uj as f64 * POWERCAP_ENERGY_UNIT).unwrap_or(0.0))
            .collect();
        PerSocketEnergy { pkg_j, dram_j }
    }

    pub fn num_sockets(&self) -> usize {
        self.num_sockets
    }
}

#[cfg(test)]
mod tests {
    use super::all_power_zones;

    #[test]
    fn test_powercap() {
        let zones = all_power_zones().expect("failed to get powercap power zones");
        for z in &zones.top {
            println!("{z}");
        }
    }
}
