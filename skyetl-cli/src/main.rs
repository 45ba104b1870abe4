//! skyetl CLI: runs the flights/airlines/airports pipeline once.

mod progress;

use clap::Parser;
use skyetl_core::config::{ConfigOverrides, load_config};
use skyetl_core::{EventBus, LoadPolicy, Pipeline, RunMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Exit status for a run stopped by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// skyetl: clean, enrich and load flight records into a relational store
#[derive(Parser, Debug)]
#[command(name = "skyetl", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.skyetl/config.toml` and the data directory)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (replaces the workspace config file)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sink connection string, e.g. sqlite://out/flights.db
    #[arg(long)]
    database_url: Option<String>,

    /// Directory that relative source paths are resolved against
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Rows per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Execution mode: materialized or streaming
    #[arg(long)]
    mode: Option<RunMode>,

    /// Load failure policy: stop_on_error, best_effort or all_or_nothing
    #[arg(long)]
    policy: Option<LoadPolicy>,

    /// Chunks buffered between streaming stages
    #[arg(long)]
    channel_capacity: Option<usize>,

    /// Load at most this many flight rows
    #[arg(long)]
    row_limit: Option<usize>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    show_config: bool,

    /// Print the final run report as JSON
    #[arg(long)]
    json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            database_url: self.database_url.clone(),
            data_dir: self.data_dir.clone(),
            chunk_size: self.chunk_size,
            load_policy: self.policy,
            mode: self.mode,
            channel_capacity: self.channel_capacity,
            flights_row_limit: self.row_limit,
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> tracing_appender::non_blocking::WorkerGuard {
    // Progress goes to stdout, so stderr only shows warnings by default.
    let filter = match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "skyetl", "skyetl")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "skyetl.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.quiet);

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = load_config(Some(&workspace), cli.config.as_deref(), Some(&cli.overrides()))
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if cli.show_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let descriptor = config.connection().map_err(|e| anyhow::anyhow!("{e}"))?;
    let sink = descriptor.connect().map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(sink = %descriptor, "Sink opened");

    let events = EventBus::default();
    let printer = (!cli.quiet).then(|| tokio::spawn(progress::print_events(events.subscribe())));

    let mut pipeline = Pipeline::new(config, sink).with_events(events);
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; stopping after the current chunk...");
            cancel.cancel();
        }
    });

    let report = pipeline.run().await;
    drop(pipeline);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !cli.quiet {
        progress::print_summary(&report);
    }

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else if report.cancelled {
        ExitCode::from(EXIT_CANCELLED)
    } else {
        if cli.quiet
            && let Some(failure) = &report.failure
        {
            eprintln!("{}", progress::failure_line(failure));
        }
        ExitCode::FAILURE
    })
}
