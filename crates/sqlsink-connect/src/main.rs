//! sqlsink-connect - Templated SQL data-sink connector
//!
//! # Usage
//!
//! ```bash
//! # Validate configuration
//! sqlsink-connect -c sqlsink.yaml validate
//!
//! # Print connector and channel status
//! sqlsink-connect -c sqlsink.yaml status
//!
//! # Write NDJSON records from stdin
//! cat records.ndjson | sqlsink-connect -c sqlsink.yaml ingest --batch-size 500
//!
//! # Print the configuration JSON schema
//! sqlsink-connect schema
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sqlsink_connect::prelude::*;

#[derive(Parser)]
#[command(name = "sqlsink-connect")]
#[command(version, about = "Templated SQL data-sink connector")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sqlsink.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file and compile every channel
    Validate,
    /// Connect and print connector and channel status
    Status,
    /// Read NDJSON `{"channel": .., "record": {..}}` lines from stdin and write them
    Ingest {
        /// Records per channel folded into one statement
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        /// Retries of a recoverable failure before giving up
        #[arg(long, default_value_t = 5)]
        max_retries: u32,
    },
    /// Print the configuration JSON schema
    Schema,
}

#[derive(Debug, Deserialize)]
struct IngestLine {
    channel: String,
    record: Record,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Validate => validate_config(&load_config(&cli.config)?),
        Commands::Status => show_status(&load_config(&cli.config)?).await,
        Commands::Ingest {
            batch_size,
            max_retries,
        } => ingest(&load_config(&cli.config)?, batch_size.max(1), max_retries).await,
        Commands::Schema => {
            println!(
                "{}",
                serde_json::to_string_pretty(&ConnectorConfig::json_schema())?
            );
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<ConnectorConfig> {
    ConnectorConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[cfg(feature = "postgres")]
fn connection_factory(config: &ConnectorConfig) -> Result<Arc<dyn ConnectionFactory>> {
    match config.scheme.as_str() {
        "postgres" | "postgresql" => Ok(Arc::new(sqlsink_rdbc::postgres::PgConnectionFactory)),
        other => anyhow::bail!("No backend for scheme '{}'", other),
    }
}

#[cfg(not(feature = "postgres"))]
fn connection_factory(config: &ConnectorConfig) -> Result<Arc<dyn ConnectionFactory>> {
    anyhow::bail!(
        "No backend for scheme '{}': built without database drivers",
        config.scheme
    )
}

fn validate_config(config: &ConnectorConfig) -> Result<()> {
    println!("Configuration is valid");
    println!("  Connector: {}", config.name);
    println!("  Server: {}://{}", config.scheme, config.server);
    println!("  Pool size: {}", config.pool_size);
    println!("  Channels: {}", config.channels.len());

    for (id, channel) in &config.channels {
        let compiled = compile(&channel.sql)?;
        println!(
            "    {} -> {} ... ({} placeholders)",
            id,
            compiled.batch_prefix,
            compiled.insert_template.placeholders().count()
        );
    }

    Ok(())
}

async fn show_status(config: &ConnectorConfig) -> Result<()> {
    let connector = Connector::start(config, connection_factory(config)?).await?;

    let status = connector.get_status().await;
    let mut channels = serde_json::Map::new();
    for id in connector.channels() {
        let channel_status = connector.get_channel_status(&id).await?;
        channels.insert(id, serde_json::to_value(channel_status)?);
    }

    let report = serde_json::json!({
        "connector": connector.pool_id(),
        "status": status,
        "channels": channels,
        "pool": {
            "size": connector.pool().size(),
            "idle": connector.pool().idle(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    connector.stop().await?;
    Ok(())
}

async fn ingest(config: &ConnectorConfig, batch_size: usize, max_retries: u32) -> Result<()> {
    let connector = Connector::start(config, connection_factory(config)?).await?;
    info!(batch_size, max_retries, "Reading records from stdin");
    if batch_size > 1 && !connector.supports_batches() {
        warn!(
            backend = %connector.pool().database_type(),
            "Backend rejects multi-row statements, writing records one at a time"
        );
    }

    let mut pending: IndexMap<String, Vec<Record>> = IndexMap::new();
    let mut stats = IngestStats::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let parsed: IngestLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(line = line_no, error = %e, "Skipping malformed input line");
                stats.failed += 1;
                continue;
            }
        };

        let buffer = pending.entry(parsed.channel.clone()).or_default();
        buffer.push(parsed.record);
        if buffer.len() >= batch_size {
            let records = std::mem::take(buffer);
            flush(&connector, &parsed.channel, records, max_retries, &mut stats).await;
        }
    }

    for (channel, records) in pending {
        if !records.is_empty() {
            flush(&connector, &channel, records, max_retries, &mut stats).await;
        }
    }

    connector.stop().await?;
    info!(
        written = stats.written,
        failed = stats.failed,
        statements = stats.statements,
        "Ingest finished"
    );

    if stats.failed > 0 {
        anyhow::bail!("{} record(s) could not be written", stats.failed);
    }
    Ok(())
}

#[derive(Debug, Default)]
struct IngestStats {
    written: usize,
    failed: usize,
    statements: usize,
}

async fn flush(
    connector: &Connector,
    channel: &str,
    records: Vec<Record>,
    max_retries: u32,
    stats: &mut IngestStats,
) {
    let batch: Vec<(String, Record)> = records
        .into_iter()
        .map(|record| (channel.to_string(), record))
        .collect();

    if connector.supports_batches() {
        write_with_retry(connector, channel, &batch, max_retries, stats).await;
    } else {
        for entry in batch.chunks(1) {
            write_with_retry(connector, channel, entry, max_retries, stats).await;
        }
    }
}

async fn write_with_retry(
    connector: &Connector,
    channel: &str,
    batch: &[(String, Record)],
    max_retries: u32,
    stats: &mut IngestStats,
) {
    let count = batch.len();
    let mut attempt = 0u32;
    loop {
        let result = match batch {
            [(id, record)] => connector.query(id, record).await,
            _ => connector.batch_query(batch).await,
        };

        match result {
            Ok(result) => {
                stats.written += count;
                stats.statements += 1;
                info!(
                    channel = %channel,
                    records = count,
                    affected_rows = result.affected_rows,
                    "Batch written"
                );
                return;
            }
            Err(e) if e.is_recoverable() && attempt < max_retries => {
                attempt += 1;
                let backoff = backoff(attempt);
                warn!(
                    channel = %channel,
                    attempt,
                    max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Recoverable failure, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!(channel = %channel, records = count, error = %e, "Batch failed");
                stats.failed += count;
                return;
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(1u64 << attempt.min(6));
    Duration::from_millis(millis.min(5_000))
}
