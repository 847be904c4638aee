use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sluice_core::{Config, Integration, JobResult, MetadataTree, Row, Table};
use sluice_drivers::ConnectionRegistry;
use sluice_metadata::{DatasetTables, IncrementalMetadataFetcher, RefreshOutcome};

/// Sluice - query and browse warehouses and relational databases
#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: sluice.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to an integration and disconnect again
    Check {
        /// Integration file (.json or .toml)
        #[arg(short, long)]
        integration: PathBuf,
    },

    /// Run a query and print its rows
    Query {
        /// Integration file (.json or .toml)
        #[arg(short, long)]
        integration: PathBuf,

        /// SQL text
        sql: String,

        /// Cancel the job after this many milliseconds
        #[arg(long)]
        cancel_after_ms: Option<u64>,

        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },

    /// List projects and datasets
    Catalog {
        /// Integration file (.json or .toml)
        #[arg(short, long)]
        integration: PathBuf,

        /// Also load the tables of these datasets
        #[arg(short, long)]
        dataset: Vec<String>,
    },

    /// List the tables and columns of one dataset
    Tables {
        /// Integration file (.json or .toml)
        #[arg(short, long)]
        integration: PathBuf,

        /// Dataset (or schema) id
        dataset: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Credentials referenced by integration files may live in .env
    dotenvy::dotenv().ok();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else if Path::new("sluice.toml").exists() {
        Config::from_file(Path::new("sluice.toml"))?
    } else {
        if cli.verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };

    let registry = Arc::new(ConnectionRegistry::new(&config));

    let outcome = match cli.command {
        Commands::Check { integration } => check_command(&registry, &integration, cli.verbose).await,
        Commands::Query {
            integration,
            sql,
            cancel_after_ms,
            json,
        } => {
            query_command(
                &registry,
                &integration,
                &sql,
                cancel_after_ms.map(Duration::from_millis),
                json,
                cli.verbose,
            )
            .await
        }
        Commands::Catalog {
            integration,
            dataset,
        } => catalog_command(&registry, &integration, &dataset, cli.verbose).await,
        Commands::Tables {
            integration,
            dataset,
        } => tables_command(&registry, &integration, &dataset, cli.verbose).await,
    };

    let closed = registry.disconnect_all().await;
    tracing::debug!(closed, "connections closed");

    outcome
}

/// Load an integration file and open a connection for it
async fn open(registry: &ConnectionRegistry, path: &Path, verbose: bool) -> Result<String> {
    let integration = Integration::from_file(path)
        .with_context(|| format!("Failed to load integration from {}", path.display()))?;

    if verbose {
        eprintln!(
            "{} {} ({})...",
            "Connecting to".cyan(),
            integration.name,
            integration.backend_type()
        );
    }

    let result = registry.connect(&integration).await;
    match result.connection_id {
        Some(connection_id) if result.success => Ok(connection_id),
        _ => Err(anyhow::anyhow!(
            "Failed to connect to {}: {}",
            integration.name,
            result.error.unwrap_or_else(|| "unknown error".to_string())
        )),
    }
}

/// Check command - verify credentials and reachability
async fn check_command(registry: &ConnectionRegistry, integration: &Path, verbose: bool) -> Result<()> {
    let connection_id = open(registry, integration, verbose).await?;

    println!("{} {}", "✓ Connected".green().bold(), connection_id);
    if let Some(backend) = registry.backend_type(&connection_id).await {
        println!("  Backend: {}", backend);
    }

    registry.disconnect(&connection_id).await?;
    Ok(())
}

/// Query command - run SQL as a job and wait for its result
async fn query_command(
    registry: &ConnectionRegistry,
    integration: &Path,
    sql: &str,
    cancel_after: Option<Duration>,
    json: bool,
    verbose: bool,
) -> Result<()> {
    let connection_id = open(registry, integration, verbose).await?;

    let job_id = registry.execute_query(&connection_id, sql).await?;
    if verbose {
        eprintln!("{} {}", "Started job".cyan(), job_id);
    }

    let result = match cancel_after {
        Some(delay) => {
            let waiting = registry.get_job_result(&connection_id, &job_id);
            tokio::pin!(waiting);
            tokio::select! {
                result = &mut waiting => result?,
                _ = tokio::time::sleep(delay) => {
                    if verbose {
                        eprintln!("{} {}", "Cancelling job".yellow(), job_id);
                    }
                    if let Err(e) = registry.cancel_job(&connection_id, &job_id).await {
                        // The job may have finished first
                        tracing::debug!(error = %e, "cancel request not delivered");
                    }
                    waiting.await?
                }
            }
        }
        None => registry.get_job_result(&connection_id, &job_id).await?,
    };

    match result {
        JobResult::Complete { rows } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_rows(&rows);
            }
            Ok(())
        }
        JobResult::Canceled => {
            println!("{}", "Job canceled".yellow().bold());
            Ok(())
        }
        JobResult::Error { message } => Err(anyhow::anyhow!("Query failed: {}", message)),
    }
}

/// Catalog command - list datasets, optionally expanding some
async fn catalog_command(
    registry: &Arc<ConnectionRegistry>,
    integration: &Path,
    datasets: &[String],
    verbose: bool,
) -> Result<()> {
    let connection_id = open(registry, integration, verbose).await?;
    let fetcher = IncrementalMetadataFetcher::new(Arc::clone(registry));

    if let RefreshOutcome::Refreshed { datasets: count } =
        fetcher.fetch_metadata_incremental(&connection_id).await?
    {
        if verbose {
            eprintln!("{} {} datasets", "Found".cyan(), count);
        }
    }

    for dataset in datasets {
        load_all_pages(&fetcher, &connection_id, dataset, verbose).await?;
    }

    let tree = fetcher
        .tree(&connection_id)
        .ok_or_else(|| anyhow::anyhow!("No metadata fetched for {}", connection_id))?;
    print_tree(&tree);

    Ok(())
}

/// Tables command - every table of one dataset with its columns
async fn tables_command(
    registry: &Arc<ConnectionRegistry>,
    integration: &Path,
    dataset: &str,
    verbose: bool,
) -> Result<()> {
    let connection_id = open(registry, integration, verbose).await?;
    let fetcher = IncrementalMetadataFetcher::new(Arc::clone(registry));

    fetcher.fetch_metadata_incremental(&connection_id).await?;
    let tables = load_all_pages(&fetcher, &connection_id, dataset, verbose).await?;

    if tables.is_empty() {
        println!("{}", "No tables found".yellow());
    }
    for table in &tables {
        print_table(table);
    }

    Ok(())
}

async fn load_all_pages(
    fetcher: &IncrementalMetadataFetcher,
    connection_id: &str,
    dataset: &str,
    verbose: bool,
) -> Result<Vec<Arc<Table>>> {
    loop {
        match fetcher.fetch_tables_for_dataset(connection_id, dataset).await? {
            DatasetTables::Fetched { tables, complete: true } | DatasetTables::Cached(tables) => {
                return Ok(tables);
            }
            DatasetTables::Fetched { tables, complete: false } => {
                if verbose {
                    eprintln!("  {} {} tables of {}...", "Loaded".cyan(), tables.len(), dataset);
                }
            }
            DatasetTables::InFlight => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

fn print_tree(tree: &MetadataTree) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Catalog".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());

    for project in &tree.projects {
        println!();
        println!("{} {}", "Project:".bold(), project.name.green());

        if project.datasets.is_empty() {
            println!("  {}", "(no datasets)".dimmed());
        }
        for dataset in &project.datasets {
            println!("  {} ({} tables)", dataset.name.bold(), dataset.table_count);
            for table in &dataset.tables {
                let marker = if table.included_in_ai_context { "•" } else { "◦" };
                println!("    {} {}", marker, table.name);
            }
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
}

fn print_table(table: &Table) {
    println!();
    println!("{}", table.name.bold().green());
    if let Some(description) = &table.description {
        println!("  {}", description.dimmed());
    }
    for field in &table.fields {
        let repeated = if field.repeated { "[]" } else { "" };
        println!("  {:<32} {}{}", field.name, field.data_type.cyan(), repeated);
        for nested in &field.fields {
            println!("    .{:<30} {}", nested.name, nested.data_type.cyan());
        }
    }
}

fn print_rows(rows: &[Row]) {
    let Some(first) = rows.first() else {
        println!("{}", "(0 rows)".dimmed());
        return;
    };

    let columns: Vec<&String> = first.keys().collect();
    println!(
        "{}",
        columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join("\t").bold()
    );
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| match row.get(c.as_str()) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => "NULL".to_string(),
                Some(other) => other.to_string(),
            })
            .collect();
        println!("{}", cells.join("\t"));
    }
    println!("{}", format!("({} rows)", rows.len()).dimmed());
}
