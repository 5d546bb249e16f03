mod app;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use sisa_offline::config::Config;
use sisa_offline::logging;
use sisa_offline::offline::MAX_TEMPORARY;

#[derive(Parser, Debug)]
#[command(name = "sisa")]
#[command(about = "Inspect and drive the Sisa offline cache and sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sisa/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level unless RUST_LOG is set
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Inspect or edit the sync queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Read or write cached state
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Inspect mirrored file records
  #[command(subcommand)]
  Files(FilesCommand),
  /// Inspect the local database
  #[command(subcommand)]
  Db(DbCommand),
  /// Replay the sync queue against the API
  Sync,
  /// Fetch a collection from the API into the cache
  Refresh {
    /// Cache key to store the collection under
    key: String,
    /// API endpoint, relative to api.base_url
    endpoint: String,
  },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
  /// List every queued write
  List,
  /// Queue a write by hand
  Enqueue {
    /// Table (entity) the write applies to
    #[arg(long)]
    table: String,
    /// create, update or delete
    #[arg(long)]
    op: String,
    /// JSON payload
    #[arg(long, default_value = "{}")]
    payload: String,
    /// Server id of the record (update/delete)
    #[arg(long)]
    record_id: Option<i64>,
    /// Temporary id of the record (create); generated when omitted
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_TEMPORARY))]
    temp_id: Option<u64>,
    /// Idempotency key; generated when omitted
    #[arg(long)]
    request_id: Option<String>,
  },
  /// Remove one queued write
  Remove { id: i64 },
  /// Remove every queued write
  Clear,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Print the cached value of a key
  Get { key: String },
  /// Store a JSON value under a key
  Set { key: String, json: String },
  /// Clear cached data (or file metadata with --files)
  Clear {
    #[arg(long)]
    files: bool,
  },
}

#[derive(Subcommand, Debug)]
pub enum FilesCommand {
  /// Files known but not downloaded
  Pending,
  /// Files attached to an entity
  For { entity_type: String, entity_id: i64 },
  /// Demote downloads whose bytes are missing or corrupt
  Verify,
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
  /// Schema version and queue size
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config, args.verbose)?;

  let app = app::App::new(config).await?;
  app.run(args.command).await?;

  Ok(())
}
