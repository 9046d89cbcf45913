// ABOUTME: CLI entry point for table-replicator
// ABOUTME: Parses commands, merges config and routes to sync/export/import/plan

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use table_replicator::archive::{ArchiveOutcome, ArchiveReport, Exporter, Importer};
use table_replicator::config::{AccountConfig, PersistPolicy, ReplicatorConfig};
use table_replicator::incremental::{SyncEvent, SyncOrchestrator, SyncOutcome};
use table_replicator::plan::plan_table_actions;
use table_replicator::table::{AzureTableService, TableService};
use table_replicator::utils::validate_source_destination_different;
use tokio_util::sync::CancellationToken;

/// Exit code of a run stopped by Ctrl+C.
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "table-replicator")]
#[command(about = "Incremental replication between table storage accounts", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to config.toml (default: ~/.table-replicator/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Do not draw a progress spinner
    #[arg(long = "no-progress", global = true, default_value_t = false)]
    no_progress: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct SourceArgs {
    /// Source table endpoint, e.g. https://myaccount.table.core.windows.net
    #[arg(long = "source")]
    source_endpoint: Option<String>,
    /// SAS token for the source account
    #[arg(long = "source-sas", env = "SOURCE_SAS_TOKEN", hide_env_values = true)]
    source_sas: Option<String>,
}

#[derive(Args, Clone, Default)]
struct DestinationArgs {
    /// Destination table endpoint
    #[arg(long = "destination")]
    destination_endpoint: Option<String>,
    /// SAS token for the destination account
    #[arg(
        long = "destination-sas",
        env = "DESTINATION_SAS_TOKEN",
        hide_env_values = true
    )]
    destination_sas: Option<String>,
}

#[derive(Args, Clone, Default)]
struct SyncArgs {
    /// Table holding the per-table watermarks on the destination
    #[arg(long = "metadata-table")]
    metadata_table: Option<String>,
    /// Rows per group write (1-100)
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,
    /// When to save watermarks
    #[arg(long, value_enum)]
    persist: Option<PersistPolicy>,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy rows changed since the last run from source to destination
    Sync {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        destination: DestinationArgs,
        #[command(flatten)]
        sync: SyncArgs,
        /// Only sync these tables (repeatable, default: all)
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// Write every table of the source account to Table_<name>.json files
    Export {
        #[command(flatten)]
        source: SourceArgs,
        /// Directory holding the archive files
        #[arg(long)]
        dir: PathBuf,
    },
    /// Load Table_<name>.json files into the destination account
    Import {
        #[command(flatten)]
        destination: DestinationArgs,
        /// Directory holding the archive files
        #[arg(long)]
        dir: PathBuf,
        /// Delete destination tables that have no archive file
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show which tables a sync would create, delete or update
    Plan {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        destination: DestinationArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = ReplicatorConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let progress = if cli.no_progress {
        ProgressBar::hidden()
    } else {
        spinner()
    };

    let cancelled = match cli.command {
        Commands::Sync {
            source,
            destination,
            sync,
            tables,
        } => {
            apply_source(&mut config, source);
            apply_destination(&mut config, destination);
            apply_sync(&mut config, sync);
            run_sync(&config, tables, &progress).await?
        }
        Commands::Export { source, dir } => {
            apply_source(&mut config, source);
            run_export(&config, dir, &progress).await?
        }
        Commands::Import {
            destination,
            dir,
            yes,
        } => {
            apply_destination(&mut config, destination);
            run_import(&config, dir, yes, &progress).await?
        }
        Commands::Plan {
            source,
            destination,
        } => {
            apply_source(&mut config, source);
            apply_destination(&mut config, destination);
            run_plan(&config).await?;
            false
        }
    };

    progress.finish_and_clear();
    if cancelled {
        println!("Cancelled. Watermarks not saved by this run will be re-synced next time.");
        std::process::exit(EXIT_CANCELLED);
    }
    Ok(())
}

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Token cancelled on the first Ctrl+C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::warn!("Received Ctrl+C, stopping after the current request");
        trigger.cancel();
    });
    token
}

fn merge_account(
    account: Option<AccountConfig>,
    endpoint: Option<String>,
    sas_token: Option<String>,
) -> Option<AccountConfig> {
    let mut account = match (account, endpoint) {
        (_, Some(endpoint)) => AccountConfig::new(endpoint, None),
        (Some(account), None) => account,
        (None, None) => return None,
    };
    if sas_token.is_some() {
        account.sas_token = sas_token;
    }
    Some(account)
}

fn apply_source(config: &mut ReplicatorConfig, args: SourceArgs) {
    config.source = merge_account(
        config.source.take(),
        args.source_endpoint,
        args.source_sas,
    );
}

fn apply_destination(config: &mut ReplicatorConfig, args: DestinationArgs) {
    config.destination = merge_account(
        config.destination.take(),
        args.destination_endpoint,
        args.destination_sas,
    );
}

fn apply_sync(config: &mut ReplicatorConfig, args: SyncArgs) {
    if let Some(table) = args.metadata_table {
        config.sync.metadata_table = table;
    }
    if let Some(size) = args.batch_size {
        config.sync.batch_size = size;
    }
    if let Some(persist) = args.persist {
        config.sync.persist = persist;
    }
}

fn connect(account: &AccountConfig, config: &ReplicatorConfig) -> anyhow::Result<AzureTableService> {
    tracing::info!("Connecting to {}", account.describe());
    AzureTableService::new(account, config.sync.request_timeout())
}

async fn run_sync(
    config: &ReplicatorConfig,
    tables: Vec<String>,
    progress: &ProgressBar,
) -> anyhow::Result<bool> {
    config.sync.validate().context("Invalid sync settings")?;
    let source_account = config.require_source()?;
    let destination_account = config.require_destination()?;
    validate_source_destination_different(source_account, destination_account)?;

    let source = connect(source_account, config)?;
    let destination = connect(destination_account, config)?;
    let cancel = cancel_on_ctrl_c();

    let bar = progress.clone();
    let orchestrator = SyncOrchestrator::new(&source, &destination, config.sync.clone())
        .with_tables(tables)
        .with_progress(move |event| match event {
            SyncEvent::Phase(phase) => bar.set_message(format!("{}", phase)),
            SyncEvent::TableStarted {
                table,
                index,
                total,
            } => bar.set_message(format!("[{}/{}] {}", index + 1, total, table)),
            SyncEvent::RowsPulled { table, rows } => {
                bar.set_message(format!("{}: {} row(s) pulled", table, rows))
            }
            SyncEvent::TableFinished {
                table,
                rows_written,
            } => bar.set_message(format!("{}: {} row(s) written", table, rows_written)),
        });

    match orchestrator.run(&cancel).await? {
        SyncOutcome::Completed(report) => {
            progress.finish_and_clear();
            println!();
            println!("========================================");
            println!("Sync complete");
            println!("========================================");
            for table in &report.tables {
                println!(
                    "  {:<32} {:>8} row(s)  up to {}",
                    table.table,
                    table.rows_written,
                    table.watermark.to_rfc3339()
                );
            }
            println!("  Tables: {}", report.tables.len());
            println!("  Rows written: {}", report.rows_written());
            println!("  Duration: {}ms", report.duration_ms);
            Ok(false)
        }
        SyncOutcome::Cancelled => Ok(true),
    }
}

async fn run_export(
    config: &ReplicatorConfig,
    dir: PathBuf,
    progress: &ProgressBar,
) -> anyhow::Result<bool> {
    let source = connect(config.require_source()?, config)?;
    let cancel = cancel_on_ctrl_c();

    progress.set_message(format!("exporting to {}", dir.display()));
    let exporter = Exporter::new(&source, dir).skip_table(config.sync.metadata_table.clone());
    match exporter.run(&cancel).await? {
        ArchiveOutcome::Completed(report) => {
            progress.finish_and_clear();
            print_archive_report("Export complete", &report);
            Ok(false)
        }
        ArchiveOutcome::Cancelled => Ok(true),
    }
}

async fn run_import(
    config: &ReplicatorConfig,
    dir: PathBuf,
    yes: bool,
    progress: &ProgressBar,
) -> anyhow::Result<bool> {
    config.sync.validate().context("Invalid sync settings")?;
    let destination = connect(config.require_destination()?, config)?;
    let importer = Importer::new(&destination, dir)
        .skip_table(config.sync.metadata_table.clone())
        .with_batch_size(config.sync.batch_size);

    let plan = importer.plan().await?;
    let deletions: Vec<&str> = plan
        .table_level()
        .into_iter()
        .filter(|(_, action)| !action.syncs_data())
        .map(|(table, _)| table)
        .collect();
    if !deletions.is_empty() && !yes {
        bail!(
            "Import would delete {} table(s) missing from {:?}: {}\n\
             Re-run with --yes to confirm.",
            deletions.len(),
            importer.dir(),
            deletions.join(", ")
        );
    }

    let cancel = cancel_on_ctrl_c();
    progress.set_message(format!("importing from {}", importer.dir().display()));
    match importer.run(&cancel).await? {
        ArchiveOutcome::Completed(report) => {
            progress.finish_and_clear();
            print_archive_report("Import complete", &report);
            Ok(false)
        }
        ArchiveOutcome::Cancelled => Ok(true),
    }
}

async fn run_plan(config: &ReplicatorConfig) -> anyhow::Result<()> {
    let source = connect(config.require_source()?, config)?;
    let destination = connect(config.require_destination()?, config)?;

    let metadata_table = &config.sync.metadata_table;
    let mut source_tables = source
        .list_tables()
        .await
        .context("Failed to list source tables")?;
    let mut destination_tables = destination
        .list_tables()
        .await
        .context("Failed to list destination tables")?;
    source_tables.retain(|t| t != metadata_table);
    destination_tables.retain(|t| t != metadata_table);

    let plan = plan_table_actions(source_tables, destination_tables);
    if plan.is_empty() {
        println!("No tables on either side.");
    } else {
        println!("{}", plan.render());
    }
    Ok(())
}

fn print_archive_report(title: &str, report: &ArchiveReport) {
    println!();
    println!("========================================");
    println!("{}", title);
    println!("========================================");
    println!("  Tables created: {}", report.tables_created.len());
    println!("  Tables deleted: {}", report.tables_deleted.len());
    for (table, rows) in &report.rows {
        println!("  {:<32} {:>8} row(s)", table, rows);
    }
    println!("  Rows: {}", report.total_rows());
}
