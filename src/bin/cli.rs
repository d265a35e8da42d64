//! TideKV CLI
//!
//! Operator tool working directly against a data directory.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tidekv::wal::WalRecovery;
use tidekv::{Config, Engine, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// TideKV CLI
#[derive(Parser, Debug)]
#[command(name = "tidekv-cli")]
#[command(about = "Inspect and modify a TideKV data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./tidekv_data")]
    data_dir: PathBuf,

    /// Buffer pool size in frames
    #[arg(long, default_value = "128")]
    frames: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },

    /// Take a checkpoint and purge old WAL segments
    Checkpoint,

    /// Scan the WAL without repairing it
    VerifyWal,

    /// Print engine statistics
    Stats,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tidekv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Commands::VerifyWal = args.command {
        let config = Config::builder().data_dir(&args.data_dir).build();
        let result = WalRecovery::verify(&config.data_dir.join("wal"))?;
        println!("segments:  {}", result.segments);
        println!("records:   {}", result.entries_recovered);
        println!("last lsn:  {}", result.last_lsn);
        println!("torn tail: {}", result.was_truncated);
        return Ok(());
    }

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .buffer_pool_frames(args.frames)
        .background_tasks(false)
        .build();
    let engine = Engine::open(config)?;

    match args.command {
        Commands::Get { key } => {
            let txn = engine.begin();
            match engine.get(&txn, key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
        }
        Commands::Put { key, value } => {
            let mut txn = engine.begin();
            engine.put(&mut txn, key.as_bytes(), value.as_bytes())?;
            let lsn = engine.commit(txn)?;
            println!("OK (lsn {})", lsn);
        }
        Commands::Delete { key } => {
            let mut txn = engine.begin();
            engine.delete(&mut txn, key.as_bytes())?;
            let lsn = engine.commit(txn)?;
            println!("OK (lsn {})", lsn);
        }
        Commands::Checkpoint => {
            let stats = engine.checkpoint_now()?;
            println!(
                "checkpoint at lsn {} (redo from {}), {} pages flushed, {} segments purged",
                stats.checkpoint_lsn, stats.redo_lsn, stats.pages_flushed, stats.segments_purged
            );
        }
        Commands::Stats => {
            let report = engine.recovery_report();
            let stats = engine.stats();
            println!("durable lsn:     {}", stats.durable_lsn);
            println!("last lsn:        {}", stats.last_lsn);
            println!("recovery redo:   {} applied, {} skipped", report.redo_applied, report.redo_skipped);
            println!("recovery losers: {}", report.losers.len());
            println!(
                "buffer pool:     {}/{} resident, {} dirty",
                stats.pool.resident, stats.pool.frames, stats.pool.dirty
            );
        }
        Commands::VerifyWal => {}
    }

    engine.close()
}
