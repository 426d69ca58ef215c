use wirefuzz_core::config::{TargetKind, WirefuzzConfig};
use wirefuzz_core::engine::{EngineEvent, EngineSettings, FuzzingEngine, RunReport};
use wirefuzz_core::export::StructureDocument;
use wirefuzz_core::generator::MessageGenerator;
use wirefuzz_core::injection::InjectedProtocolStructure;
use wirefuzz_core::learner::{LearnEvent, StructureLearner, read_captures};
use wirefuzz_core::monitor::MonitorClient;
use wirefuzz_core::pool::WorkerPool;
use wirefuzz_core::progress::channel;
use wirefuzz_core::target::{MonitorTarget, Target, TcpTarget};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "wirefuzz.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Learn a protocol structure from captured messages.
    Learn(LearnArgs),
    /// Fuzz a target using a learned structure.
    Fuzz(FuzzArgs),
    /// Query a monitor for its connectors and watchers.
    Probe,
}

#[derive(Args, Debug)]
struct LearnArgs {
    /// Raw capture files, one message each.
    #[clap(required = true, num_args = 2..)]
    captures: Vec<PathBuf>,
    /// Where to write the structure document; stdout when omitted.
    #[clap(short, long)]
    output: Option<PathBuf>,
    #[clap(short, long)]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct FuzzArgs {
    /// Structure document produced by `learn`.
    #[clap(short, long)]
    structure: PathBuf,
    #[clap(long)]
    host: Option<String>,
    #[clap(long)]
    port: Option<u16>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(long)]
    output_dir: Option<PathBuf>,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<WirefuzzConfig> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from {:?}", config_path);
            WirefuzzConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(
                    "No config file specified, loading default {:?}",
                    default_config_path
                );
                WirefuzzConfig::load_from_file(default_config_path)
            } else {
                debug!("No config file found, using built-in defaults");
                Ok(WirefuzzConfig::default())
            }
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            token.cancel();
        }
    });
    cancel
}

async fn learn(config: &WirefuzzConfig, args: LearnArgs) -> anyhow::Result<()> {
    let captures = read_captures(&args.captures).context("Failed to read captures")?;
    let workers = args.workers.unwrap_or(config.fuzzer.workers);
    let learner = StructureLearner::new(WorkerPool::new(workers));
    let cancel = cancel_on_ctrl_c();

    let (events, mut rx) = channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                LearnEvent::Progress(progress) => info!("Learning {}", progress),
                LearnEvent::Structure(structure) => debug!("Intermediate structure {}", structure),
                LearnEvent::Finished(_) | LearnEvent::Canceled => break,
            }
        }
    });

    let result = learner.learn(captures, &cancel, &events).await;
    drop(events);
    let _ = reporter.await;
    let structure = result.context("Structure learning failed")?;
    info!("Learned structure {}", structure);

    let document = StructureDocument::from_structure(&structure);
    match args.output {
        Some(path) => {
            document
                .write_to(&path)
                .with_context(|| format!("Failed to write structure to {path:?}"))?;
            info!("Structure written to {:?}", path);
        }
        None => println!("{}", document.to_json()?),
    }
    Ok(())
}

async fn run_engine<T: Target>(
    target: T,
    generator: MessageGenerator,
    settings: EngineSettings,
) -> anyhow::Result<RunReport> {
    let cancel = cancel_on_ctrl_c();
    let (events, mut rx) = channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Progress(progress) if progress.done % 100 == 0 => {
                    info!("Sent {}", progress)
                }
                EngineEvent::Progress(progress) => debug!("Sent {}", progress),
                EngineEvent::Crash { iteration } => {
                    warn!("Crash recorded at iteration {}", iteration)
                }
                _ => {}
            }
        }
    });

    let mut engine = FuzzingEngine::new(target, generator, settings, events);
    let report = engine.run(&cancel).await;
    drop(engine);
    let _ = reporter.await;
    Ok(report?)
}

async fn fuzz(
    mut config: WirefuzzConfig,
    config_path: Option<&Path>,
    args: FuzzArgs,
) -> anyhow::Result<()> {
    if let Some(host) = args.host {
        config.target.host = host;
    }
    if let Some(port) = args.port {
        config.target.port = port;
    }
    if let Some(iterations) = args.iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    if let Some(seed) = args.seed {
        config.fuzzer.seed = Some(seed);
    }
    if let Some(output_dir) = args.output_dir {
        config.fuzzer.output_dir = output_dir;
    }
    config.validate().context("Invalid configuration")?;
    debug!("Effective configuration: {:#?}", config);

    let document = StructureDocument::read_from(&args.structure)
        .with_context(|| format!("Failed to read structure {:?}", args.structure))?;
    let structure = document
        .to_structure()
        .context("Structure document is invalid")?;
    info!("Fuzzing structure {}", structure);

    let mut injected = InjectedProtocolStructure::from_structure(&structure);
    let base_dir = config_path
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new("."));
    config
        .apply_injection(&mut injected, base_dir)
        .context("Invalid [injection] section")?;
    let random = config.random_source();
    info!("Random source seeded with {}", random.seed());
    let generator = MessageGenerator::new(injected, random)?;

    let settings = config.engine_settings();
    let report = match config.target.kind {
        TargetKind::Direct => {
            let target = TcpTarget::new(config.target_addr()?, config.timeout());
            run_engine(target, generator, settings).await?
        }
        TargetKind::Monitor => {
            let setup = config
                .session_setup()
                .context("Monitor target needs a [monitor] section")?;
            let timeout = config
                .monitor
                .as_ref()
                .map_or(config.timeout(), |m| Duration::from_millis(m.response_timeout_ms));
            let target = MonitorTarget::new(config.monitor_addr()?, setup, timeout);
            run_engine(target, generator, settings).await?
        }
    };

    let (state, iterations, crashes, duration) =
        (report.state, report.iterations, report.crashes, report.duration);
    let outage = report.outage;
    let records = report
        .recorder
        .persist(&config.fuzzer.output_dir)
        .context("Failed to persist records")?;

    println!("Run {state}: {iterations} messages sent in {duration:.2?} ({outage:.2?} outage).");
    println!(
        "Crashes: {}, records saved: {} in {:?}",
        crashes,
        records.len(),
        config.fuzzer.output_dir
    );
    Ok(())
}

async fn probe(config: &WirefuzzConfig) -> anyhow::Result<()> {
    let monitor = config
        .monitor
        .as_ref()
        .context("Probing needs a [monitor] section")?;
    let timeout = Duration::from_millis(monitor.response_timeout_ms);
    let mut client = MonitorClient::connect(config.monitor_addr()?, timeout)
        .await?
        .with_response_timeout(timeout);

    let version = client.are_you_there(&monitor.protocol_version).await?;
    println!("Monitor version: {version}");
    println!("Connectors:");
    for connector in client.connectors().await? {
        println!("  {connector}");
    }

    client.select_connector(&monitor.connector).await?;
    if let Some(setup) = config.session_setup() {
        if !setup.parameters.is_empty() {
            client.set_connector_parameters(&setup.parameters).await?;
        }
    }
    client
        .call_target_for_testing()
        .await
        .with_context(|| format!("Connector {} cannot reach the target", monitor.connector))?;
    println!("Watchers for {}:", monitor.connector);
    for watcher in client.watchers().await? {
        println!("  {watcher}");
    }
    client.reset().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config_file.as_deref();
    let config = load_config(config_path)?;

    match cli.command {
        Commands::Learn(args) => learn(&config, args).await,
        Commands::Fuzz(args) => fuzz(config, config_path, args).await,
        Commands::Probe => probe(&config).await,
    }
}
