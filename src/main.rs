use anyhow::Context;
use clap::Parser;
use etw_collector::collector::{CollectorModule, InitializeOutcome};
use etw_collector::config::CollectorSettings;
use etw_collector::error::ConfigError;
use etw_collector::events::TraceEvent;
use etw_collector::session::{EventInjector, MemorySession};
use log::{debug, error, info, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long shutdown waits for the consumer to drain
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments for the ETW collector
#[derive(Parser)]
#[command(
    name = "etw-collector",
    about = "Replay captured trace events through the ETW collector module",
    long_about = "Reads trace events as JSON lines, filters them through a trace session \
                  with the configured providers enabled, and forwards matching events \
                  to the configured telemetry sink."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Trace events to replay
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "JSON lines file with trace events (defaults to stdin)"
    )]
    input: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

/// Load settings, falling back to defaults when the file does not exist
fn load_settings(path: Option<&Path>) -> Result<CollectorSettings, ConfigError> {
    match path {
        Some(path) => match CollectorSettings::from_file(path) {
            Ok(settings) => Ok(settings),
            Err(ConfigError::ReadError(e)) => {
                warn!("Configuration file unreadable ({}), using defaults", e);
                Ok(CollectorSettings::default())
            }
            Err(e) => Err(e),
        },
        None => {
            info!("No configuration file specified, using defaults");
            Ok(CollectorSettings::default())
        }
    }
}

/// Inject every parseable line of `reader` into the session
///
/// Returns the number of events injected.
fn replay_events(reader: impl BufRead, injector: &EventInjector) -> usize {
    let mut injected = 0;

    for (line_number, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<TraceEvent>(&line) {
            Ok(event) => {
                if injector.inject(event).is_err() {
                    debug!("Session disposed, stopping replay");
                    break;
                }
                injected += 1;
            }
            Err(e) => warn!("Skipping malformed event on line {}: {}", line_number + 1, e),
        }
    }

    injected
}

fn spawn_replay_thread(
    input: Option<PathBuf>,
    injector: EventInjector,
    shutdown: Sender<()>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let reader: Box<dyn BufRead + Send> = match input {
        Some(path) => Box::new(BufReader::new(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let handle = thread::Builder::new()
        .name("etw-replay".to_string())
        .spawn(move || {
            let injected = replay_events(reader, &injector);
            info!("Replayed {} events", injected);

            // Give the consumer a chance to drain before shutting down
            while injector.pending() > 0 {
                thread::sleep(Duration::from_millis(50));
            }
            let _ = shutdown.send(());
        })?;
    Ok(handle)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = load_settings(cli.config.as_deref()).context("loading configuration")?;

    let session = MemorySession::new("etw-collector-replay", Some(true));
    let injector = session.injector();
    let module = CollectorModule::new(Arc::new(session)).with_sources(settings.sources.clone());

    match module.initialize(Some(&settings.sink)) {
        InitializeOutcome::Started(report) => {
            info!(
                "Collector started: {} providers enabled, {} failed",
                report.enabled_count(),
                report.failed_count()
            );
        }
        InitializeOutcome::NoSources => {
            anyhow::bail!("no sources configured; add [[sources]] entries to the configuration")
        }
        InitializeOutcome::Aborted(e) => anyhow::bail!("collector initialization failed: {}", e),
    }

    let (shutdown_sender, shutdown_receiver) = mpsc::channel();
    let interrupt_sender = shutdown_sender.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down");
        let _ = interrupt_sender.send(());
    })
    .context("installing interrupt handler")?;

    let replay = spawn_replay_thread(cli.input, injector, shutdown_sender)?;

    info!("Collector is running. Press Ctrl+C to stop.");
    let _ = shutdown_receiver.recv();

    if !module.dispose_and_wait(SHUTDOWN_TIMEOUT) {
        warn!("Consumer did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }
    // A replay blocked on stdin is abandoned; it exits with the process
    if replay.is_finished() {
        let _ = replay.join();
    }

    info!("Collector stopped");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
