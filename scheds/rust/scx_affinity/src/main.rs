// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use crossbeam::channel::unbounded;
use crossbeam::channel::Sender;
use log::info;
use log::warn;
use scx_stats::prelude::*;
use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;

use scx_affinity::entrypoint::Entrypoint;
use scx_affinity::entrypoint::EntrypointOpts;
use scx_affinity::host::CpuGrid;
use scx_affinity::host::HostCpu;
use scx_affinity::host::ProcfsTraceFactory;
use scx_affinity::host::SchedPinning;
use scx_affinity::host::ThreadRegistry;
use scx_affinity::outbound::Outbound;
use scx_affinity::rpc::spawn_reader;
use scx_affinity::rpc::RequestRouter;
use scx_affinity::stats;
use scx_affinity::trace::TraceFactory;
use scx_affinity::AffinitySpace;
use scx_affinity::Config;
use scx_affinity::SchedulerService;
use scx_affinity::SCHEDULER_NAME;

/// User space CPU-affinity scheduler.
///
/// Client requests are read as newline-delimited JSON-RPC from stdin and
/// answered on stdout. Logs go to stderr. SIGHUP reloads the policy document.
#[derive(Debug, Clone, Parser)]
#[command(name = "scx_affinity", version, disable_version_flag = true)]
struct Opts {
    /// Policy document (TOML).
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Write the status report (JSON) to this file.
    #[clap(short = 'r', long)]
    report: Option<PathBuf>,

    /// CPU grid as WxH, numbering CPUs 0.. in row-major order. Defaults to
    /// one row per last-level cache.
    #[clap(long)]
    affinity_space: Option<AffinitySpace>,

    /// Control loop period in microseconds. Overrides the policy document.
    #[clap(short = 'i', long)]
    interval_us: Option<u64>,

    /// procfs mount point.
    #[clap(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// Enable stats monitoring with the specified interval in seconds.
    /// Printed to stderr since stdout carries responses.
    #[clap(long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval. Scheduler
    /// is not launched.
    #[clap(long)]
    monitor: Option<f64>,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

fn spawn_reload_listener(reload: Sender<()>) -> Result<()> {
    let mut signals = Signals::new([SIGHUP]).context("Failed to register SIGHUP handler")?;
    std::thread::Builder::new()
        .name("reload".to_string())
        .spawn(move || {
            for _ in signals.forever() {
                if reload.send(()).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} {}", SCHEDULER_NAME, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    if lcfg.set_time_offset_to_local().is_err() {
        eprintln!("Failed to set local time offset");
    }
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Some(intv) = opts.monitor {
        let intv = Duration::from_secs_f64(intv);
        return stats::monitor(intv, shutdown, std::io::stdout());
    }

    let stats_thread = match opts.stats {
        Some(intv) => {
            let shutdown_copy = shutdown.clone();
            Some(std::thread::spawn(move || {
                let intv = Duration::from_secs_f64(intv);
                if let Err(e) = stats::monitor(intv, shutdown_copy, std::io::stderr()) {
                    warn!("stats monitor thread finished because of an error {}", e);
                }
            }))
        }
        None => None,
    };

    let (reload_tx, reload_rx) = unbounded();
    spawn_reload_listener(reload_tx)?;

    let grid = match opts.affinity_space {
        Some(space) => CpuGrid::linear(space),
        None => CpuGrid::detect()?,
    };
    let space = grid.space();
    info!("{} on a {} CPU grid", SCHEDULER_NAME, space);

    let registry = ThreadRegistry::default();
    let cpu = HostCpu::new(
        opts.proc_root.clone(),
        grid.clone(),
        registry.clone(),
        Box::new(SchedPinning),
    );
    let (outbound, worker) = Outbound::spawn(Box::new(cpu))?;
    let trace: Box<dyn TraceFactory> =
        Box::new(ProcfsTraceFactory::new(opts.proc_root.clone(), grid, registry));

    let mut service = SchedulerService::new(outbound, space, Some(trace))
        .with_log_level(llv)
        .with_interval_override(opts.interval_us);
    if let Some(path) = opts.report.clone() {
        service = service.with_report_path(path);
    }
    if let Some(path) = opts.config.clone() {
        let config = Config::load(&path)?;
        service = service.with_config_path(path);
        service.apply_config(config);
    } else {
        warn!("no policy document, threads keep their placement");
    }

    let (session_tx, session_rx) = unbounded();
    let (thread_tx, thread_rx) = unbounded();
    let router = RequestRouter {
        session: session_tx,
        thread: thread_tx,
    };
    spawn_reader(BufReader::new(std::io::stdin()), router)?;

    let stats_server = match StatsServer::new(stats::server_data()).launch() {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("stats server unavailable: {:#}", e);
            None
        }
    };

    let entry_opts = EntrypointOpts { exit_on_eof: false };
    let mut entrypoint = Entrypoint::new(
        &service,
        session_rx,
        thread_rx,
        reload_rx,
        std::io::stdout(),
        entry_opts,
    );
    if let Some(server) = stats_server.as_ref() {
        entrypoint = entrypoint.with_stats(server.channels());
    }
    entrypoint.run(shutdown)?;

    drop(service);
    worker.join();

    if let Some(jh) = stats_thread {
        if jh.join().is_err() {
            warn!("stats monitor thread panicked");
        }
    }
    info!("{} exited", SCHEDULER_NAME);
    Ok(())
}
