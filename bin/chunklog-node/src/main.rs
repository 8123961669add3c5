//! chunklog node - backup log service and log file tools
//!
//! `run` serves backup messages read as JSON lines from stdin and answers
//! requests with JSON lines on stdout. The other commands work on log
//! files offline.

use anyhow::{Context, Result};
use chunklog_common::RESERVED_NODE_ID;
use chunklog_node::{Config, LogFormat, Overrides};
use chunklog_storage::{LogContext, LogEngine, Message, MessageDispatcher, SecondaryLog, recover_from_file};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "chunklog-node")]
#[command(about = "chunklog backup log node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/chunklog/node.toml", env = "CHUNKLOG_CONFIG")]
    config: PathBuf,

    /// Node ID
    #[arg(long)]
    node_id: Option<u16>,

    /// Directory holding the log files
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve backup messages (JSON lines) from stdin
    Run,
    /// Check the configuration and print the log geometry
    Validate,
    /// Print the segment table of a secondary log file
    Inspect {
        /// Log file name in the backup directory
        file: String,
    },
    /// Recover the chunks of a secondary log file
    RecoverFile {
        /// Log file name in the backup directory
        file: String,
        /// Write every chunk's payload to this directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?.with_overrides(Overrides {
        node_id: args.node_id,
        backup_directory: args.backup_dir,
        log_level: args.log_level,
        log_format: args.log_format,
    });

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    config.validate()?;

    match args.command {
        Commands::Run => run(config),
        Commands::Validate => {
            print!("{}", config.describe());
            Ok(())
        }
        Commands::Inspect { file } => inspect(config, &file),
        Commands::RecoverFile { file, output } => recover(config, &file, output),
    }
}

fn run(config: Config) -> Result<()> {
    let engine = Arc::new(
        LogEngine::start(config.log, config.node.id).context("failed to start log engine")?,
    );
    let dispatcher = MessageDispatcher::new(engine.clone());
    info!("Serving backup messages for node 0x{:04X}", engine.node_id());

    let stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();
    for (number, line) in stdin.lines().enumerate() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Message = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed message on line {}: {}", number + 1, e);
                continue;
            }
        };
        if let Some(response) = dispatcher.dispatch(message) {
            serde_json::to_writer(&mut stdout, &response)?;
            writeln!(stdout)?;
            stdout.flush()?;
        }
    }

    if let Err(e) = engine.flush_all() {
        error!("Final flush failed: {}", e);
    }
    info!("Input closed\n{}", engine.current_utilization());
    engine.shutdown();
    Ok(())
}

fn inspect(config: Config, file: &str) -> Result<()> {
    let ctx = LogContext::new(config.log, RESERVED_NODE_ID)?;
    let log = SecondaryLog::open(ctx.clone(), file).with_context(|| format!("failed to open {file}"))?;

    println!(
        "{}: range {}, creator 0x{:04X}{}",
        log.file_name(),
        log.key(),
        log.original_owner(),
        if log.is_migration() { ", migration" } else { "" }
    );
    println!(
        "{} of {} bytes used ({}%), {} segments of {} bytes",
        log.occupied(),
        log.capacity(),
        log.utilization(),
        log.segment_count(),
        log.segment_size()
    );
    println!("{:<8} {:<12} {:<8} {:<10}", "SEGMENT", "USED", "UTIL", "AGE");
    let now = ctx.now_secs();
    for (idx, header) in log.segment_headers().iter().enumerate() {
        println!(
            "{:<8} {:<12} {:<8} {:<10}",
            idx,
            header.used,
            format!("{:.1}%", header.utilization(log.segment_size()) * 100.0),
            header.age(now)
        );
    }
    log.close()?;
    Ok(())
}

fn recover(config: Config, file: &str, output: Option<PathBuf>) -> Result<()> {
    let result = recover_from_file(config.log, file).with_context(|| format!("failed to recover {file}"))?;

    if let Some(dir) = &output {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    println!("{:<20} {:<12} {:<10}", "CHUNK", "VERSION", "BYTES");
    for chunk in &result.chunks {
        println!(
            "{:<20} {:<12} {:<10}",
            chunk.chunk_id.to_string(),
            chunk.version.to_string(),
            chunk.payload.len()
        );
        if let Some(dir) = &output {
            let path = dir.join(format!("{:016x}", chunk.chunk_id.raw()));
            std::fs::write(&path, &chunk.payload)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }

    println!(
        "{} chunks, {} bytes, {} ID ranges in {:?}",
        result.count(),
        result.total_bytes(),
        result.chunk_id_ranges.len(),
        result.elapsed
    );
    if !result.is_complete() {
        warn!(
            "Partial recovery: {} corrupted entries, {} truncated and {} unreadable segments, {} incomplete chunks",
            result.corrupted_entries, result.truncated_segments, result.failed_segments, result.incomplete_chunks
        );
    }
    Ok(())
}
