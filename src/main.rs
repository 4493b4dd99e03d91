use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use gpucoexec::interconn::ToyInterconnect;
use gpucoexec::{config, exec, kernel, mem_fetch};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// GPU configuration (YAML)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
    /// Kernels to simulate (YAML)
    #[arg(short, long, value_name = "KERNELS")]
    kernels: PathBuf,
    /// Stop after this many core cycles
    #[arg(long)]
    cycles: Option<u64>,
    /// Write statistics as JSON to this path
    #[arg(short, long, value_name = "STATS")]
    stats: Option<PathBuf>,
    /// Issue width of the synthetic engine per core
    #[arg(long, default_value = "4")]
    issue_width: usize,
    /// Print tracing spans when they close
    #[arg(long)]
    trace_spans: bool,
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Deserialize)]
struct KernelSpec {
    launch: kernel::KernelLaunch,
    #[serde(default)]
    profile: Option<exec::Profile>,
}

/// Routes `log` records to `env_logger` and, optionally, closed tracing spans to stderr.
///
/// The span subscriber is installed without a `log` bridge, since `env_logger`
/// already owns the global logger.
fn init_logging(verbose: u8, trace_spans: bool) -> eyre::Result<()> {
    let mut log_builder = env_logger::Builder::from_default_env();
    match verbose {
        0 => {}
        1 => {
            log_builder.filter_level(log::LevelFilter::Info);
        }
        2 => {
            log_builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            log_builder.filter_level(log::LevelFilter::Trace);
        }
    }
    log_builder.try_init()?;

    if trace_spans {
        let subscriber = tracing_subscriber::fmt()
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();

    init_logging(options.verbose, options.trace_spans)?;

    let mut config = match options.config {
        Some(ref path) => config::GPU::from_path(path)?,
        None => config::GPU::default(),
    };
    if let Some(cycles) = options.cycles {
        config.limits.max_cycles = Some(cycles);
    }
    config.validate()?;
    let config = Arc::new(config);

    let kernels_file = std::fs::File::open(&options.kernels)
        .wrap_err_with(|| format!("failed to open {}", options.kernels.display()))?;
    let kernels: Vec<KernelSpec> = serde_yaml::from_reader(std::io::BufReader::new(kernels_file))
        .wrap_err_with(|| format!("failed to parse {}", options.kernels.display()))?;
    if kernels.is_empty() {
        eyre::bail!("{} lists no kernels", options.kernels.display());
    }

    let mut engine = exec::Synthetic::new(options.issue_width, exec::Profile::default());
    for spec in &kernels {
        if let Some(profile) = spec.profile {
            engine.set_profile(spec.launch.id, profile);
        }
    }

    let interconn: Arc<ToyInterconnect<mem_fetch::MemFetch>> = Arc::new(ToyInterconnect::new(
        config.num_simt_clusters,
        config.num_sub_partitions(),
        config.interconn_buffer_size,
    ));
    let mut sim = gpucoexec::Simulator::new(interconn, engine, Arc::clone(&config));
    for spec in kernels {
        sim.add_kernel(spec.launch);
    }

    let start = Instant::now();
    sim.run_to_completion()?;
    eprintln!(
        "simulated {} cycles ({} instructions, ipc {:.3}) in {:?}",
        sim.stats.sim.cycles,
        sim.stats.sim.instructions,
        sim.stats.ipc(),
        start.elapsed()
    );
    for (id, kernel) in &sim.stats.kernels {
        eprintln!(
            "  kernel {id} ({}): {} instructions in {} cycles",
            kernel.name,
            kernel.instructions,
            kernel.cycles().unwrap_or(0)
        );
    }
    if let Some(outcome) = sim.stats.coexec.as_ref().and_then(|coexec| coexec.outcome.as_ref()) {
        eprintln!("  co-execution {outcome}");
    }

    if let Some(ref stats_path) = options.stats {
        gpucoexec::save_stats_to_file(&sim.stats, stats_path)?;
    }
    Ok(())
}
