//! NUMA memory readings, shelled out to `numastat` the same way the rest of
//! this workspace shells out to benchmark tools and parses their stdout with
//! `regex` (see `cli_poll_rapl`'s `bench.rs`).

use std::process::{Command, Stdio};

use anyhow::{anyhow, Context};
use log::warn;
use regex::Regex;

/// The kind of system-wide NUMA memory figure to read, mirroring the column
/// names `numastat -m` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaMemKind {
    MemUsed,
    MemTotal,
    MemFree,
}

impl NumaMemKind {
    fn row_label(self) -> &'static str {
        match self {
            NumaMemKind::MemUsed => "MemUsed",
            NumaMemKind::MemTotal => "MemTotal",
            NumaMemKind::MemFree => "MemFree",
        }
    }
}

/// Reads a system-wide NUMA memory figure (in MiB) for every socket, from
/// `numastat -m`.
pub fn read_socket_numa_mem_mib(kind: NumaMemKind, num_sockets: usize) -> anyhow::Result<Vec<f64>> {
    let output = Command::new("numastat")
        .arg("-m")
        .stdout(Stdio::piped())
        .output()
        .context("spawning `numastat -m`")?;
    let stdout = std::str::from_utf8(&output.stdout).context("non-utf8 numastat output")?;

    let row = find_row(stdout, kind.row_label())
        .ok_or_else(|| anyhow!("no `{}` row in numastat -m output", kind.row_label()))?;
    let values = parse_row_values(row, num_sockets)?;
    Ok(values)
}

/// Reads the private (NUMA-local) resident memory of a process, broken down
/// per socket, in MiB. Returns zeros (with a warning) if the pid has gone, or
/// if the expected `Private` row can't be found in `numastat -v -p <pid>`.
pub fn read_private_numa_mem_mib(pid: i32, num_sockets: usize) -> Vec<f64> {
    let result = (|| -> anyhow::Result<Vec<f64>> {
        let output = Command::new("numastat")
            .args(["-v", "-p", &pid.to_string()])
            .stdout(Stdio::piped())
            .output()
            .context("spawning `numastat -v -p`")?;
        let stdout = std::str::from_utf8(&output.stdout).context("non-utf8 numastat output")?;

        let row = find_row(stdout, "Private")
            .ok_or_else(|| anyhow!("no `Private` row in numastat output for pid {pid}"))?;
        parse_row_values(row, num_sockets)
    })();

    match result {
        Ok(values) => values,
        Err(err) => {
            warn!("failed to get NUMA memory for pid {pid}: {err:#}");
            vec![0.0; num_sockets]
        }
    }
}

/// Finds the last line whose first whitespace-delimited token is `label`.
/// `numastat -v -p <pid>` prints a `Total` row followed by a `Private` row
/// per memory class; we want the last (the process' own total), matching the
/// original's `| tail -1` pipeline.
fn find_row<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    text.lines().filter(|l| l.split_whitespace().next() == Some(label)).last()
}

fn parse_row_values(row: &str, num_sockets: usize) -> anyhow::Result<Vec<f64>> {
    // the row looks like: "MemUsed          7820.73         15013.31 ... 1234.56"
    // the label is one token, the socket columns follow, and some numastat
    // versions append a "Total" column at the end that we must drop.
    let numeric = Regex::new(r"^-?[0-9]+(\.[0-9]+)?$").unwrap();
    let tokens: Vec<&str> = row.split_whitespace().skip(1).filter(|t| numeric.is_match(t)).collect();

    if tokens.len() < num_sockets {
        return Err(anyhow!(
            "expected at least {num_sockets} numeric columns in numastat row, got {}: {row:?}",
            tokens.len()
        ));
    }

    tokens[..num_sockets]
        .iter()
        .map(|t| t.parse::<f64>().with_context(|| format!("parsing numastat value {t:?}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem_used_row() {
        let row = "MemUsed          7820.73         15013.31";
        let values = parse_row_values(row, 2).unwrap();
        assert_eq!(values, vec![7820.73, 15013.31]);
    }

    #[test]
    fn finds_last_matching_row() {
        let text = "Total             100.0   200.0\nPrivate            50.0   60.0\nPrivate            51.0   61.0\n";
        let row = find_row(text, "Private").unwrap();
        assert!(row.starts_with("Private            51.0"));
    }
}
