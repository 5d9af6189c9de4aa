//! mssql-mongo-migrate CLI - replicate SQL Server into MongoDB and remap foreign keys.

use clap::{Parser, Subcommand};
use mssql_mongo_migrate::error::{EXIT_CANCELLED, EXIT_REPLICATION_FAILED};
use mssql_mongo_migrate::{
    Config, MigrateError, MigrationPlan, MigrationReport, Orchestrator, RunStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Dangling references listed in the text summary before truncating.
const DANGLING_PREVIEW: usize = 20;

#[derive(Parser)]
#[command(name = "mssql-mongo-migrate")]
#[command(about = "Replicate a SQL Server database into MongoDB and remap foreign keys")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration
    Run {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Additional table to skip (schema.table); repeatable
        #[arg(long = "skip", value_name = "TABLE")]
        skip: Vec<String>,

        /// Dry run: resolve tables and keys and show the plan without moving data
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a previously interrupted migration
    Resume {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Compare source rows, target records and remap entries per table
    Validate,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            workers,
            skip,
            dry_run,
        } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            for table in skip {
                if !config.migration.skip.contains(&table) {
                    config.migration.skip.push(table);
                }
            }
            config.validate()?;

            let mut orchestrator = Orchestrator::new(config).await?;

            if dry_run {
                let plan = orchestrator.plan().await?;
                if cli.output_json {
                    println!("{}", plan.to_json()?);
                } else {
                    print_plan(&orchestrator, &plan);
                }
                return Ok(0);
            }

            if let Some(ref path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path.clone());
            }

            let cancel_token = setup_signal_handler();
            let report = orchestrator.run(cancel_token).await?;
            print_report(&report, cli.output_json, "Migration finished")?;
            Ok(report_exit_code(&report))
        }

        Commands::Resume { workers } => {
            // State file is required for resume
            let state_file = cli.state_file.ok_or_else(|| {
                MigrateError::Config("--state-file is required for resume".to_string())
            })?;

            if !state_file.exists() {
                return Err(MigrateError::Config(format!(
                    "State file not found: {:?}",
                    state_file
                )));
            }

            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }

            let orchestrator = Orchestrator::new(config)
                .await?
                .with_state_file(state_file)
                .resume()?;

            info!("Resuming from previous state");
            let cancel_token = setup_signal_handler();
            let report = orchestrator.run(cancel_token).await?;
            print_report(&report, cli.output_json, "Migration resumed and finished")?;
            Ok(report_exit_code(&report))
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::new(config).await?;
            let results = orchestrator.validate().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Validation Results:");
                for r in &results {
                    println!(
                        "  {} {}: source={} target={} remap={}",
                        if r.matches { "OK      " } else { "MISMATCH" },
                        r.table,
                        r.source_rows,
                        r.target_records,
                        r.remap_entries
                    );
                }
            }

            if results.iter().all(|r| r.matches) {
                Ok(0)
            } else {
                warn!("Validation found mismatched tables");
                Ok(EXIT_REPLICATION_FAILED)
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source ({}): {} ({}ms)",
                    result.source_type,
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target ({}): {} ({}ms)",
                    result.target_type,
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
            Ok(0)
        }
    }
}

fn report_exit_code(report: &MigrationReport) -> u8 {
    match report.status {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => EXIT_CANCELLED,
        RunStatus::Failed | RunStatus::Running => EXIT_REPLICATION_FAILED,
    }
}

fn print_plan(orchestrator: &Orchestrator, plan: &MigrationPlan) {
    let migration = &orchestrator.config().migration;

    println!("Dry run: {} tables", plan.tables.len());
    for table in &plan.tables {
        let key = match &table.primary_key {
            Some(cols) => cols.join(", "),
            None => "-".to_string(),
        };
        println!(
            "  {} [pk: {}] -> {}, {}",
            table.name,
            key,
            table.name,
            migration.remap_collection(&table.name)
        );
        for fk in &table.foreign_keys {
            println!("      {} -> {}", fk.source_column, fk.referenced_table);
        }
    }
    if !plan.skipped.is_empty() {
        println!("  Skipped: {}", plan.skipped.join(", "));
    }
    for warning in &plan.warnings {
        println!("  Warning: {}", warning);
    }
}

fn print_report(report: &MigrationReport, json: bool, headline: &str) -> Result<(), MigrateError> {
    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    println!("\n{} ({:?})", headline, report.status);
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Tables: {}/{} remapped",
        report.tables_remapped, report.tables_total
    );
    println!("  Rows: {}", report.rows_replicated);
    println!("  Remap entries: {}", report.remap_entries);
    println!("  Fields remapped: {}", report.fields_remapped);
    println!("  Dangling references: {}", report.dangling_references);

    let dangling = report.tables.iter().flat_map(|t| t.dangling.iter());
    for d in dangling.clone().take(DANGLING_PREVIEW) {
        println!(
            "    {}.{} = {} -> {} (record {})",
            d.table, d.column, d.value, d.referenced_table, d.record_id
        );
    }
    if report.dangling_references > DANGLING_PREVIEW {
        println!(
            "    ... {} more",
            report.dangling_references - DANGLING_PREVIEW
        );
    }

    if !report.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", report.failed_tables);
    }
    if !report.remap_failures.is_empty() {
        println!("  Remap failures: {:?}", report.remap_failures);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    // RUST_LOG, when set, takes precedence over --verbosity.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
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
/// Handles both SIGINT (Ctrl-C) and SIGTERM (Kubernetes/Airflow shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Cancelling migration...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Cancelling migration...");
            token.cancel();
        }
    });

    cancel_token
}
