//! ndload - load newline-delimited JSON into database destinations

use anyhow::{Context, Result};
use clap::Parser;
use ndload_common::logging::{init_logging, LogConfig, LogLevel};
use ndload_common::LoaderConfig;
use ndload_ingest::{
    filtered_records, ingest_stream, ndjson_records, prepare_destinations, AdapterRegistry,
    DispatchOptions,
};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tokio::io::{AsyncRead, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ndload")]
#[command(author, version, about = "Stream NDJSON records into database destinations")]
struct Cli {
    /// Loader configuration file
    #[arg(short, long, default_value = "ndload.yml")]
    config: PathBuf,

    /// Target namespace to load
    #[arg(short, long)]
    target: String,

    /// Input file; standard input when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Records per batch (overrides the configuration file)
    #[arg(short, long)]
    batch_size: Option<NonZeroUsize>,

    /// Executable that reshapes the raw input into NDJSON
    #[arg(short, long)]
    filter: Option<PathBuf>,

    /// Maximum number of concurrently running batch writes
    #[arg(long)]
    max_in_flight: Option<NonZeroUsize>,

    /// Write batches to each destination strictly in arrival order
    #[arg(long)]
    ordered: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Connection strings may reference variables from .env
    dotenvy::dotenv().ok();

    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    let _guard = init_logging(&log_config)?;

    let config = LoaderConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let destinations = config.namespace(&cli.target)?;

    let batch_size = cli
        .batch_size
        .or(NonZeroUsize::new(config.batch_size))
        .context("batch size must be greater than 0")?;
    let options = DispatchOptions {
        max_in_flight: cli
            .max_in_flight
            .or(config.max_in_flight.and_then(NonZeroUsize::new)),
        ordered: cli.ordered || config.ordered,
    };

    info!(
        target_namespace = %cli.target,
        destinations = destinations.len(),
        "Preparing destinations"
    );
    let registry = AdapterRegistry::with_defaults();
    let ready = prepare_destinations(&registry, destinations).await?;

    let input: Box<dyn AsyncRead + Unpin + Send> = match cli.input {
        Some(ref path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input file {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let summary = match cli.filter {
        Some(ref filter) => {
            ingest_stream(filtered_records(input, filter)?, batch_size, ready, options).await?
        },
        None => {
            let records = ndjson_records(BufReader::new(input));
            ingest_stream(records, batch_size, ready, options).await?
        },
    };

    for (destination, rows) in &summary.rows_written {
        info!(destination = %destination, rows, "Destination loaded");
    }
    info!(
        batches = summary.batches,
        records = summary.records,
        "ndload finished"
    );

    Ok(())
}
