use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Per-process CPU-package and DRAM energy attribution, via Intel RAPL")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output directory for CSV trace files.
    #[arg(long, default_value = "./data/results", global = true)]
    pub output: String,

    /// File recording the estimated/loaded baseline power.
    #[arg(long, default_value = "./data/baseline_power.json", global = true)]
    pub basefile: String,

    /// Sampling period in seconds for baseline power estimation.
    #[arg(long, default_value_t = 2.0, global = true)]
    pub base_period: f64,

    /// Sampling period in seconds for RAPL power meters (also used by the
    /// NUMA/residency sampler thread). Must be >= 10ms.
    #[arg(long, default_value_t = 0.01, global = true)]
    pub rapl_period: f64,

    /// Interval in seconds between two power estimations. Must be >= 50ms.
    #[arg(long, default_value_t = 1.0, global = true)]
    pub interval: f64,

    /// Non-linear scaling factor for CPU power.
    #[arg(long, default_value_t = 0.3, global = true)]
    pub gamma: f64,

    /// Non-linear scaling factor for DRAM power.
    #[arg(long, default_value_t = 0.2, global = true)]
    pub delta: f64,

    /// Logging level.
    #[arg(long, default_value = "info", global = true)]
    pub loglvl: String,

    /// Debug-log emission cadence in seconds (only takes effect at
    /// `--loglvl debug`).
    #[arg(long, default_value_t = 3, global = true)]
    pub logging: u64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check hardware support (RAPL domains, topology, NUMA tooling) and exit.
    Check,

    /// Estimate idle (static) package/DRAM power and save it to `--basefile`.
    Basepower,

    /// Attach to a running target and trace its ascribed energy consumption.
    Trace {
        /// PID of the target application.
        #[arg(long)]
        pid: Option<i32>,

        /// Name of the target application (used to look up its PID).
        #[arg(long)]
        name: Option<String>,
    },
}
