//! stripestore-disk - disk layout and journal maintenance utility
//!
//! Prepares regular files (or block devices) for the block storage engine,
//! drains the journal as a one-shot operation, and prints the state a
//! read-only recovery pass observes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use stripestore_engine::Blockstore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stripestore-disk")]
#[command(about = "stripestore block storage disk utility")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and zero a single-file layout and print its engine config
    Init {
        /// Backing file to create
        #[arg(long)]
        data: PathBuf,
        /// Total file size in bytes
        #[arg(long)]
        size: u64,
        /// Object block size
        #[arg(long, default_value_t = 131_072)]
        block_size: u32,
        /// Journal region size
        #[arg(long, default_value_t = 16 * 1024 * 1024)]
        journal_size: u64,
    },
    /// Replay the journal, flush everything it holds and exit
    FlushJournal {
        /// Engine config (TOML with an [engine] table of string options)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run a read-only recovery pass and print what it found
    Inspect {
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Engine options file: every key under `[engine]` is passed through to the
/// engine as a string.
#[derive(Debug, Deserialize)]
struct FileConfig {
    engine: BTreeMap<String, toml::Value>,
}

fn load_options(path: &PathBuf) -> Result<BTreeMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let parsed: FileConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    let mut options = BTreeMap::new();
    for (k, v) in parsed.engine {
        let s = match v {
            toml::Value::String(s) => s,
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            other => bail!("engine.{k}: unsupported value {other:?}"),
        };
        options.insert(k, s);
    }
    Ok(options)
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Init {
            data,
            size,
            block_size,
            journal_size,
        } => cmd_init(data, size, block_size, journal_size),
        Command::FlushJournal { config } => cmd_flush_journal(&config),
        Command::Inspect { config } => cmd_inspect(&config),
    }
}

fn cmd_init(data: PathBuf, size: u64, block_size: u32, journal_size: u64) -> Result<()> {
    const MB: u64 = 1024 * 1024;
    if size < journal_size + 16 * MB {
        bail!("size too small: need at least journal_size + 16 MiB");
    }
    let journal_offset = 0u64;
    let meta_offset = journal_size;
    // generous metadata reservation, data starts at the next MiB boundary
    let meta_reserve = (size / u64::from(block_size)) * 128 + MB;
    let data_offset = (meta_offset + meta_reserve).div_ceil(MB) * MB;
    if data_offset + u64::from(block_size) > size {
        bail!("size too small for the metadata reservation");
    }

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&data)
        .with_context(|| format!("failed to create {}", data.display()))?;
    file.set_len(size)?;

    // zero the journal and metadata regions so the engine sees them fresh
    let zeros = vec![0u8; MB as usize];
    let mut pos = 0u64;
    file.seek(SeekFrom::Start(0))?;
    while pos < data_offset {
        let chunk = (data_offset - pos).min(MB) as usize;
        file.write_all(&zeros[..chunk])?;
        pos += chunk as u64;
    }
    file.sync_all()?;

    info!(path = %data.display(), size, "layout initialized");
    println!("[engine]");
    println!("data_device = {:?}", data.display().to_string());
    println!("block_size = \"{block_size}\"");
    println!("journal_offset = \"{journal_offset}\"");
    println!("journal_size = \"{journal_size}\"");
    println!("meta_offset = \"{meta_offset}\"");
    println!("data_offset = \"{data_offset}\"");
    Ok(())
}

fn cmd_flush_journal(config: &PathBuf) -> Result<()> {
    let mut options = load_options(config)?;
    options.insert("flush_journal".to_string(), "true".to_string());
    let mut engine = Blockstore::open(&options).context("failed to open engine")?;
    info!(
        journal_used = engine.journal_used_bytes(),
        dirty = engine.dirty_count(),
        "draining journal"
    );
    engine.drain_journal().context("journal drain failed")?;
    info!("journal drained");
    Ok(())
}

fn cmd_inspect(config: &PathBuf) -> Result<()> {
    let mut options = load_options(config)?;
    options.insert("readonly".to_string(), "true".to_string());
    options.insert("disable_device_lock".to_string(), "true".to_string());
    let engine = Blockstore::open(&options).context("failed to open engine")?;
    println!("block_size:      {}", engine.block_size());
    println!("blocks total:    {}", engine.total_block_count());
    println!("blocks free:     {}", engine.free_block_count());
    println!("journal length:  {}", engine.journal_len());
    println!("journal used:    {}", engine.journal_used_bytes());
    println!("dirty entries:   {}", engine.dirty_count());
    Ok(())
}
