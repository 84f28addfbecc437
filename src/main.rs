//! cache-persist - command line front end
//!
//! Every invocation replays the persistence root into a fresh in-memory
//! cache, runs one command against it and exits. That makes the binary a
//! small tool for inspecting and editing a persistence directory, and an
//! end-to-end exercise of the recovery path.

use anyhow::{Context, Result};
use bytes::Bytes;
use cache_persist::codec::RawBytesCodec;
use cache_persist::config::PersistConfig;
use cache_persist::persistence::{PersistSolver, Persistence, RecoveryPipeline, Runner};
use cache_persist::storage::StorageEngine;
use cache_persist::time::TimeUnit;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Inspect and edit a cache persistence directory.
#[derive(Parser, Debug)]
#[command(name = "cache-persist", version, about)]
struct Cli {
    /// Persistence root (overrides CACHE_PERSIST_PATH).
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// File name prefix (overrides CACHE_PERSIST_FILE_PREFIX).
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value, optionally with a ttl.
    Put {
        key: String,
        value: String,
        #[arg(long)]
        ttl: Option<u64>,
        #[arg(long, default_value = "ms")]
        unit: TimeUnit,
    },
    /// Print a value and its remaining ttl.
    Get { key: String },
    /// Give a key a new ttl starting now.
    Extend {
        key: String,
        #[arg(long)]
        ttl: u64,
        #[arg(long, default_value = "ms")]
        unit: TimeUnit,
    },
    /// Restart a key's ttl.
    Reset { key: String },
    /// Replace a value, keeping the ttl.
    Replace { key: String, value: String },
    /// Delete a key.
    Remove { key: String },
    /// List keys matching a glob pattern.
    Similar { pattern: String },
    /// Delete every record, including files no key owns.
    Clean,
    /// Only run recovery and print the report.
    Recover,
}

fn load_config(cli: &Cli) -> Result<PersistConfig> {
    let mut config = PersistConfig::from_env().context("invalid persistence configuration")?;
    // The tool exists to operate on the store, so it is always on.
    config.enabled = true;
    if let Some(path) = &cli.path {
        config.root = path.clone();
    }
    if let Some(prefix) = &cli.prefix {
        config.file_prefix = prefix.clone();
    }
    Ok(config)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "cache_persist=debug" } else { "cache_persist=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    info!(root = %config.root.display(), "Opening persistence root");

    let persistence: Persistence<Bytes, Bytes> =
        Persistence::new(config, RawBytesCodec, RawBytesCodec);
    // A one-shot process must not exit with writes in flight.
    let solver = PersistSolver::with_runner(persistence.clone(), Runner::Sync);
    let cache = Arc::new(StorageEngine::with_persistence(solver));

    let report = RecoveryPipeline::new(persistence.clone())
        .with_hook(cache.clone())
        .run();
    for failure in &report.failures {
        warn!(path = %failure.path.display(), error = %failure.error, "Skipped record");
    }

    match cli.command {
        Command::Put { key, value, ttl, unit } => {
            let (key, value) = (Bytes::from(key), Bytes::from(value));
            match ttl {
                Some(ttl) => cache.set_with_ttl(key, value, unit.to_duration(ttl)),
                None => cache.set(key, value),
            };
            println!("OK");
        }
        Command::Get { key } => {
            let key = Bytes::from(key);
            match cache.get(&key) {
                Some(value) => {
                    let ttl = cache.pttl(&key).unwrap_or(-1);
                    println!("{}\t(ttl {} ms)", String::from_utf8_lossy(&value), ttl);
                }
                None => println!("(nil)"),
            }
        }
        Command::Extend { key, ttl, unit } => {
            print_outcome(cache.expire(&Bytes::from(key), unit.to_duration(ttl)));
        }
        Command::Reset { key } => {
            print_outcome(cache.touch(&Bytes::from(key)));
        }
        Command::Replace { key, value } => {
            print_outcome(cache.replace(&Bytes::from(key), Bytes::from(value)));
        }
        Command::Remove { key } => {
            print_outcome(cache.delete(&Bytes::from(key)));
        }
        Command::Similar { pattern } => {
            let mut keys = cache.keys(&pattern);
            keys.sort();
            for key in &keys {
                println!("{}", String::from_utf8_lossy(key));
            }
            println!("({} keys)", keys.len());
        }
        Command::Clean => {
            cache.flush();
            let removed = persistence.clean_all()?;
            println!("removed {} stray files", removed);
        }
        Command::Recover => {
            println!(
                "scanned {} restored {} expired {} failed {}",
                report.scanned,
                report.restored,
                report.expired,
                report.failures.len()
            );
        }
    }
    Ok(())
}

fn print_outcome(applied: bool) {
    println!("{}", if applied { "OK" } else { "(nil)" });
}
