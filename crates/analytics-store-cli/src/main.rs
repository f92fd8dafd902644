//! analytics-store CLI - administrative interface for the storage layer.

use analytics_store::{
    Backend, MigrationConfig, MigrationEngine, RunStatus, StorageAdapter, StorageConfig,
    StoreError,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "analytics-store")]
#[command(about = "Administrative CLI for the analytics dataset and blob store")]
#[command(version)]
struct Cli {
    /// Path to YAML storage configuration
    #[arg(short, long, default_value = "storage.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the configured backend
    HealthCheck,

    /// Parse and validate the configuration without connecting
    ValidateConfig,

    /// Copy every dataset and blob from one backend to another
    Migrate {
        /// Configuration of the backend to copy from
        #[arg(long)]
        source: PathBuf,

        /// Configuration of the backend to copy to
        #[arg(long)]
        destination: PathBuf,

        /// Ledger file for resumable runs (in memory only when omitted)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Dataset ids fetched per enumeration page
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Run one reconciliation sweep against the configured backend
    Reconcile {
        /// Override the minimum age of reclaimable orphans, in seconds
        #[arg(long)]
        grace_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), StoreError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(StoreError::Config)?;

    match cli.command {
        Commands::ValidateConfig => {
            let config = load_config(&cli.config)?;
            if cli.output_json {
                let out = json!({
                    "valid": true,
                    "backend": config.backend.kind().to_string(),
                    "location": config.backend.location(),
                    "fingerprint": config.fingerprint(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Configuration is valid");
                println!("  Backend: {}", config.backend.kind());
                println!("  Location: {}", config.backend.location());
                println!("  Inline threshold: {} bytes", config.blob.inline_threshold_bytes);
            }
        }

        Commands::HealthCheck => {
            let config = load_config(&cli.config)?.with_auto_tuning();
            let location = config.backend.location();
            let started = Instant::now();
            let outcome = Backend::connect(&config).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            if cli.output_json {
                let out = json!({
                    "backend": config.backend.kind().to_string(),
                    "location": location,
                    "healthy": outcome.is_ok(),
                    "latency_ms": latency_ms,
                    "error": outcome.as_ref().err().map(|e| e.to_string()),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  {} ({}): {} ({}ms)",
                    config.backend.kind(),
                    location,
                    if outcome.is_ok() { "OK" } else { "FAILED" },
                    latency_ms
                );
                if let Err(ref e) = outcome {
                    println!("    Error: {}", e);
                }
            }
            outcome?;
        }

        Commands::Reconcile { grace_secs } => {
            let config = load_config(&cli.config)?.with_auto_tuning();
            let backend = Backend::connect(&config).await?;
            let report = backend
                .reconcile(grace_secs.map(Duration::from_secs))
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Reconciliation completed for {}", backend.location());
                println!("  Tombstones finished: {}", report.tombstones_finished);
                println!("  Blob deletions settled: {}", report.blob_deletions_settled);
                println!("  Orphan files removed: {}", report.files_removed);
            }
        }

        Commands::Migrate {
            source,
            destination,
            ledger,
            page_size,
        } => {
            let source_config = load_config(&source)?.with_auto_tuning();
            let destination_config = load_config(&destination)?.with_auto_tuning();

            let mut options: MigrationConfig = source_config.migration.clone();
            if let Some(path) = ledger {
                options.ledger_path = Some(path);
            }
            if let Some(n) = page_size {
                if n == 0 {
                    return Err(StoreError::Config("--page-size must be at least 1".into()));
                }
                options.page_size = n;
            }

            let engine =
                MigrationEngine::from_configs(&source_config, &destination_config, options).await?;

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
            let report = with_shutdown_deadline(
                engine.run(cancel_token.clone()),
                &cancel_token,
                cli.shutdown_timeout,
            )
            .await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                println!("\nMigration {}", status_word(report.status));
                println!("  Run ID: {}", report.run_id);
                println!("  Duration: {:.2}s", report.duration_seconds);
                println!("  Copied: {}", report.copied);
                println!("  Verified: {}", report.verified);
                println!("  Skipped: {}", report.skipped);
                println!("  Failed: {}", report.failed);
                if !report.failed_ids.is_empty() {
                    println!("  Failed datasets: {:?}", report.failed_ids);
                }
            }

            match report.status {
                RunStatus::Cancelled => return Err(StoreError::Cancelled),
                _ if report.failed > 0 => {
                    return Err(StoreError::MigrationIncomplete {
                        failed: report.failed,
                    })
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<StorageConfig, StoreError> {
    let config = StorageConfig::load(path)?;
    info!("Loaded configuration from {:?}", path);
    Ok(config)
}

fn status_word(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::Failed => "finished with failures",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Running => "running",
    }
}

/// Await `work`, but give up `timeout_secs` after cancellation was requested.
async fn with_shutdown_deadline<T>(
    work: impl Future<Output = Result<T, StoreError>>,
    cancel: &CancellationToken,
    timeout_secs: u64,
) -> Result<T, StoreError> {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        } => {
            warn!("Shutdown timeout of {}s elapsed; abandoning the current record", timeout_secs);
            Err(StoreError::Cancelled)
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (orchestrator shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, StoreError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Finishing the current record (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(_shutdown_timeout: u64) -> Result<CancellationToken, StoreError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing the current record...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
