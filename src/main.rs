use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use gridstep::config::{Config, Control};
use gridstep::error::{ExitStatus, SolverError};
use gridstep::launch::{self, LaunchOptions};
use gridstep::output::OutputWriter;

#[derive(Debug, Parser)]
#[clap(version, about = "Time integration of multi-block structured-grid flow simulations")]
struct Opts {
    /// Job name; the configuration is read from {job}.config.toml
    #[clap(short, long)]
    job: String,

    #[clap(short, long, default_value = ".")]
    run_dir: PathBuf,

    /// Snapshot index to resume from (0 starts afresh)
    #[clap(short, long, default_value = "0")]
    tindx: usize,

    /// Wall-clock budget in seconds
    #[clap(long)]
    max_wall_clock: Option<f64>,

    /// Number of in-process workers
    #[clap(short, long, default_value = "1")]
    workers: usize,

    /// Rank of this process in a multi-process run
    #[clap(long, requires = "peers")]
    rank: Option<usize>,

    /// Comma-separated addresses of every rank, in rank order
    #[clap(long, value_delimiter = ',')]
    peers: Vec<SocketAddr>,

    #[clap(short, long)]
    zip_files: bool,

    /// One of off, error, warn, info, debug, trace
    #[clap(short, long, default_value = "info")]
    verbosity: String,
}

fn run(opts: &Opts, halt: Arc<AtomicBool>) -> Result<(), SolverError> {
    let config_path = opts.run_dir.join(format!("{}.config.toml", opts.job));
    let config = Config::from_file(&config_path)?;
    let control_path = OutputWriter::new(&opts.run_dir, &opts.job, opts.zip_files).control_path();

    let control = if control_path.exists() {
        Control::read(&control_path)?
    } else {
        warn!("{} not found; using default control parameters", control_path.display());
        Control::default()
    };
    let options = LaunchOptions {
        run_dir: opts.run_dir.clone(),
        job: opts.job.clone(),
        compressed: opts.zip_files,
        start_tindx: opts.tindx,
        max_wall_clock: opts.max_wall_clock.map(Duration::from_secs_f64),
        halt,
    };

    let reasons = match opts.rank {
        Some(rank) => launch::run_tcp_rank(&config, &control, rank, opts.peers.clone(), &options)?,
        None if opts.workers > 1 => launch::run_workers(&config, &control, opts.workers, &options)?,
        None => launch::run_single(&config, &control, &options)?,
    };
    info!("{} finished: {:?}", opts.job, reasons);
    Ok(())
}

fn main() {
    let opts = Opts::parse();
    let level = LevelFilter::from_str(&opts.verbosity).unwrap_or(LevelFilter::Info);

    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("logger: {}", e);
    }

    let halt = Arc::new(AtomicBool::new(false));

    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&halt)) {
            warn!("could not install handler for signal {}: {}", signal, e);
        }
    }

    let status = match run(&opts, halt) {
        Ok(()) => ExitStatus::Success,
        Err(e) => {
            error!("{}", e);
            e.exit_status()
        }
    };
    process::exit(status.code())
}
