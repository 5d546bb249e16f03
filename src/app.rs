use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use sisa_offline::api::ApiClient;
use sisa_offline::cache::{shared_cache, CacheLayer};
use sisa_offline::config::Config;
use sisa_offline::db::schema::SCHEMA_VERSION;
use sisa_offline::db::{shared_database, Database, FileRecord, NewQueueItem, QueueOperation, SyncQueueItem};
use sisa_offline::offline::EntityId;
use sisa_offline::sync;

use crate::{CacheCommand, Command, DbCommand, FilesCommand, QueueCommand};

/// Handles to the local stores, opened once per invocation.
pub struct App {
  config: Config,
  db: Arc<Database>,
  cache: CacheLayer,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let db = shared_database(&config.database_path()?).await?;
    let cache = shared_cache(config.cache_path()?.as_deref()).await;
    Ok(Self { config, db, cache })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Queue(cmd) => self.queue(cmd),
      Command::Cache(cmd) => self.cache(cmd).await,
      Command::Files(cmd) => self.files(cmd),
      Command::Db(DbCommand::Status) => self.db_status(),
      Command::Sync => self.sync().await,
      Command::Refresh { key, endpoint } => self.refresh(&key, &endpoint).await,
    }
  }

  fn queue(&self, cmd: QueueCommand) -> Result<()> {
    match cmd {
      QueueCommand::List => {
        let items = self.db.list_all()?;
        if items.is_empty() {
          println!("Queue is empty");
        }
        for item in &items {
          println!("{}", describe_item(item));
        }
      }
      QueueCommand::Enqueue {
        table,
        op,
        payload,
        record_id,
        temp_id,
        request_id,
      } => {
        let operation: QueueOperation = op.parse()?;
        let payload: Value =
          serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;

        let mut item = NewQueueItem::new(table, operation, payload);
        if let Some(record_id) = record_id {
          item = item.with_record_id(record_id);
        }
        let temp_id = match (operation, temp_id) {
          (_, Some(raw)) => Some(EntityId::temporary(raw)?),
          (QueueOperation::Create, None) => Some(EntityId::new_temporary()),
          _ => None,
        };
        if let Some(temp_id) = temp_id {
          item = item.with_temp_id(temp_id);
        }
        if let Some(request_id) = request_id {
          item = item.with_request_id(request_id);
        }

        let id = self.db.enqueue(item)?;
        match temp_id {
          Some(temp_id) => println!("Queued #{} (temporary id {})", id, temp_id),
          None => println!("Queued #{}", id),
        }
      }
      QueueCommand::Remove { id } => {
        if !self.db.remove(id)? {
          return Err(eyre!("Queue item {} does not exist", id));
        }
        println!("Removed #{}", id);
      }
      QueueCommand::Clear => {
        let removed = self.db.clear_queue()?;
        println!("Removed {} queued writes", removed);
      }
    }
    Ok(())
  }

  async fn cache(&self, cmd: CacheCommand) -> Result<()> {
    match cmd {
      CacheCommand::Get { key } => match self.cache.persistent().get::<Value>(&key).await {
        Some(value) => println!("{}", pretty(&value)?),
        None => println!("{} is not cached", key),
      },
      CacheCommand::Set { key, json } => {
        let value: Value =
          serde_json::from_str(&json).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
        let state = self.cache.bind(&key, Value::Null);
        state.set(value);
        state.unbind();
        self.cache.persistent().flush().await;
        println!("Stored {}", key);
      }
      CacheCommand::Clear { files: true } => {
        self.cache.clear_files().await;
        println!("Cleared file metadata");
      }
      CacheCommand::Clear { files: false } => {
        self.cache.clear_all().await;
        println!("Cleared cached data");
      }
    }
    Ok(())
  }

  fn files(&self, cmd: FilesCommand) -> Result<()> {
    match cmd {
      FilesCommand::Pending => print_files(&self.db.files_pending_download()?),
      FilesCommand::For {
        entity_type,
        entity_id,
      } => print_files(&self.db.files_for_entity(&entity_type, entity_id)?),
      FilesCommand::Verify => {
        let demoted = self.db.verify_downloads()?;
        if demoted.is_empty() {
          println!("All downloads verified");
        } else {
          println!("Marked {} files for download again: {:?}", demoted.len(), demoted);
        }
      }
    }
    Ok(())
  }

  fn db_status(&self) -> Result<()> {
    println!("Database:       {}", self.config.database_path()?.display());
    println!("Schema version: {} (target {})", self.db.schema_version()?, SCHEMA_VERSION);
    println!("Queued writes:  {}", self.db.count_replayable()?);
    Ok(())
  }

  async fn sync(&self) -> Result<()> {
    let api = ApiClient::new(&self.config)?;

    let report = sync::replay(&self.db, |item| {
      let api = api.clone();
      async move { api.submit_queue_item(&item).await }
    })
    .await?;

    println!("Confirmed {} writes, {} remaining", report.confirmed, report.remaining);
    for resolved in &report.resolved {
      println!("  {} -> {}", resolved.temporary, resolved.remote_id);
    }
    if let Some(failure) = report.failed {
      println!("Stopped at #{}: {}", failure.queue_id, failure.message);
    }
    Ok(())
  }

  async fn refresh(&self, key: &str, endpoint: &str) -> Result<()> {
    let api = ApiClient::new(&self.config)?;
    let state = self.cache.bind(key, Vec::<Value>::new());
    state.wait_hydrated().await;

    let result = self
      .cache
      .refresh(&state, || api.fetch_collection::<Value>(endpoint))
      .await;
    self.cache.persistent().flush().await;
    state.unbind();

    info!(key, source = ?result.source, items = result.data.len(), "Refresh finished");
    if result.is_offline() {
      println!("Offline: kept {} cached items for {}", result.data.len(), key);
    } else {
      println!("Stored {} items under {}", result.data.len(), key);
    }
    Ok(())
  }
}

fn describe_item(item: &SyncQueueItem) -> String {
  let target = match (item.record_id, item.local_temp_id) {
    (Some(id), _) => format!("record {}", id),
    (None, Some(temp)) => format!("temp {}", temp),
    (None, None) => "-".to_string(),
  };
  let mut line = format!(
    "#{:<5} {:<8} {:<7} {:<16} {}",
    item.id, item.status, item.operation, item.table_name, target
  );
  if let Some(error) = &item.last_error {
    line.push_str(&format!("  ({})", error));
  }
  line
}

fn print_files(files: &[FileRecord]) {
  if files.is_empty() {
    println!("No files");
  }
  for file in files {
    let location = file.local_path.as_deref().unwrap_or("not downloaded");
    println!("{:<6} {:<32} {:>10}  {}", file.id, file.name, file.size, location);
  }
}

fn pretty(value: &Value) -> Result<String> {
  serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format value: {}", e))
}
