use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use energat::baseline::Baseline;
use energat::cli::{Cli, Commands};
use energat::config::Config;
use energat::status_store::StatusStore;
use energat::{affinity, engine, sampler, sink};

use rapl_probes::numa::{read_socket_numa_mem_mib, NumaMemKind};
use rapl_probes::proctime;
use rapl_probes::topology::Topology;

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env = env_logger::Env::default().default_filter_or(&cli.loglvl);
    env_logger::init_from_env(env);

    let config = Config::new(
        cli.output.clone(),
        cli.basefile.clone(),
        cli.base_period,
        cli.rapl_period,
        cli.interval,
        cli.gamma,
        cli.delta,
        cli.logging,
    )?;

    match cli.command {
        Commands::Check => run_check(),
        Commands::Basepower => run_basepower(&config).await,
        Commands::Trace { pid, name } => run_trace(&config, pid, name).await,
    }
}

fn run_check() -> Result<()> {
    let topology = Topology::discover().context("discovering CPU topology")?;
    let num_sockets = topology.num_sockets();

    let hierarchy = rapl_probes::powercap::all_power_zones().context("discovering RAPL zones")?;
    let rapl = rapl_probes::powercap::RaplReader::open(&hierarchy, num_sockets)
        .map_err(energat::error::EngineError::from_rapl_open)?;
    let max_joules = rapl.max_joules();

    let server_cputime = proctime::server_cputime_per_socket_sec(&topology)?;
    let mem_total = read_socket_numa_mem_mib(NumaMemKind::MemTotal, num_sockets).unwrap_or_default();

    info!("socket count:        {num_sockets}");
    info!("host CPU times:      {server_cputime:?}");
    info!("total NUMA memories: {mem_total:?}");
    info!("RAPL package ranges: {:?}", max_joules.pkg_j);
    info!("system check passed!");
    Ok(())
}

async fn run_basepower(config: &Config) -> Result<()> {
    let topology = Topology::discover().context("discovering CPU topology")?;
    let num_sockets = topology.num_sockets();

    let hierarchy = rapl_probes::powercap::all_power_zones().context("discovering RAPL zones")?;
    let mut rapl = rapl_probes::powercap::RaplReader::open(&hierarchy, num_sockets)
        .map_err(energat::error::EngineError::from_rapl_open)?;

    let baseline = Baseline::estimate(&topology, &mut rapl, config.base_period)?;
    baseline.save(&config.basefile)?;
    Ok(())
}

async fn run_trace(config: &Config, pid: Option<i32>, name: Option<String>) -> Result<()> {
    let Some(root_pid) = pid else {
        bail!("no target process specified (pass --pid)");
    };

    if !proctime::task_exists(root_pid) {
        bail!("target application ({root_pid}) doesn't exist");
    }

    let project = name.unwrap_or_else(|| format!("target-{root_pid}"));

    let topology = Arc::new(Topology::discover().context("discovering CPU topology")?);
    let num_sockets = topology.num_sockets();

    let baseline = Baseline::load(&config.basefile, num_sockets)?;

    let store = Arc::new(Mutex::new(StatusStore::new(num_sockets)));
    let stop = Arc::new(AtomicBool::new(false));

    let output_path = std::path::Path::new(&config.output).join(format!("energat_traces_{project}.csv"));
    let (sink_handle, writer_handle) = sink::spawn_csv_sink(output_path)?;

    let tracer_process_pid = std::process::id() as i32;
    if let Err(err) = affinity::pin_least_loaded(&[tracer_process_pid], &topology, 1) {
        warn!("failed to pin tracer to a least-loaded core: {err:#}");
    }

    let sampler_handle = sampler::spawn(
        Arc::clone(&store),
        Arc::clone(&topology),
        num_sockets,
        config.rapl_period,
        Arc::clone(&stop),
    );

    let engine_stop = Arc::clone(&stop);
    let engine_handle = engine::run_on_dedicated_thread(
        root_pid,
        Arc::clone(&topology),
        Arc::clone(&store),
        baseline,
        config.clone(),
        sink_handle,
        engine_stop,
    );

    info!("tracing pid {root_pid} ({project})");

    let mut engine_task = tokio::task::spawn_blocking(move || engine_handle.join().expect("engine thread panicked"));

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping tracer");
            stop.store(true, Ordering::SeqCst);
            engine_task.await.context("engine task panicked")??;
        }
        result = &mut engine_task => {
            result.context("engine task panicked")??;
            info!("engine loop exited (target no longer alive)");
        }
    }

    stop.store(true, Ordering::SeqCst);
    sampler_handle.join().expect("sampler thread panicked");
    writer_handle.await.context("writer task panicked")??;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err:#}");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
