use northwind_loader::config::{Catalog, Destination, BASE_URL_ENV, DEFAULT_BASE_URL};
use northwind_loader::ingestion::{
    Fetcher, IngestionOrchestrator, RunSummary, TableBuilder, EXIT_SETUP_ERROR,
};

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "northwind-loader")]
#[command(about = "Load the Northwind CSV files into DuckDB tables")]
#[command(version)]
struct Args {
    /// Path to the DuckDB database file (default: in-memory)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Base URL or directory for relative sources (or set NORTHWIND_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// JSON catalog replacing the built-in Northwind datasets
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Only load the named dataset (repeatable)
    #[arg(long = "only")]
    only: Vec<String>,

    /// Print this many rows of nw_customers after loading
    #[arg(long, default_value_t = 0)]
    preview: usize,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "northwind_loader=info".into()),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(summary) => ExitCode::from(summary.exit_code()),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_SETUP_ERROR)
        }
    }
}

async fn run(args: Args) -> Result<RunSummary> {
    let mut catalog = match &args.catalog {
        Some(path) => Catalog::from_json_file(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => Catalog::northwind(),
    };
    catalog.retain_only(&args.only)?;

    let base_url = args
        .base_url
        .or_else(|| std::env::var(BASE_URL_ENV).ok())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    info!("Base URL: {}", base_url);

    let destination = Destination::from_option(args.db);
    let mut target = TableBuilder::open_with_fallback(&destination)
        .context("Failed to open destination database")?;

    let fetcher = Fetcher::new(Duration::from_secs(args.timeout_secs))?;
    let orchestrator = IngestionOrchestrator::new(Arc::new(fetcher), base_url);
    let summary = orchestrator.run(&catalog, &mut target).await?;

    println!("\n{}", summary);

    if args.preview > 0 {
        print_preview(&target, "nw_customers", args.preview);
    }

    Ok(summary)
}

fn print_preview(target: &TableBuilder, table: &str, limit: usize) {
    println!("First {} rows of '{}':", limit, table);
    match target.preview(table, limit) {
        Ok(rows) => {
            for row in rows {
                let cells: Vec<&str> = row.iter().map(|c| c.as_deref().unwrap_or("NULL")).collect();
                println!("  ({})", cells.join(", "));
            }
        }
        Err(e) => println!("  Error running preview query: {}", e),
    }
}
