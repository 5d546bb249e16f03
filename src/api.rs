//! REST client for the Sisa API.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::db::{QueueOperation, SyncQueueItem};
use crate::sync::Confirmation;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// API client wrapper
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  token: String,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(config.api_base_url()?, token)
  }

  pub fn with_token(base_url: &str, token: impl Into<String>) -> Result<Self> {
    let http = reqwest::Client::builder()
      .gzip(true)
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: parse_base_url(base_url)?,
      token: token.into(),
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    join_endpoint(&self.base_url, path)
  }

  /// Fetch a whole collection, e.g. `accounts` or `journal-entries`.
  pub async fn fetch_collection<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Vec<T>> {
    let url = self.endpoint(endpoint)?;
    debug!(%url, "Fetching collection");

    let response = self
      .http
      .get(url)
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", endpoint, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("HTTP {}", status.as_u16()));
    }

    let body: Value = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to read {} response: {}", endpoint, e))?;
    parse_collection(body).map_err(|e| eyre!("Failed to parse {} response: {}", endpoint, e))
  }

  /// Send one queued write as a single-op batch.
  ///
  /// The item's batch id doubles as the idempotency key, so resending the
  /// same item cannot apply it twice.
  pub async fn submit_queue_item(&self, item: &SyncQueueItem) -> Result<Confirmation> {
    let batch_id = item
      .batch_id
      .as_deref()
      .ok_or_else(|| eyre!("Queue item {} has no batch id", item.id))?;
    let request = BatchRequest {
      batch_id,
      ops: vec![BatchOp::from_item(item)?],
    };

    let response = self
      .http
      .post(self.endpoint("sync/batch")?)
      .bearer_auth(&self.token)
      .header("Idempotency-Key", batch_id)
      .json(&request)
      .send()
      .await
      .map_err(|e| eyre!("Failed to submit queue item {}: {}", item.id, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("HTTP {}", status.as_u16()));
    }

    let body: BatchResponse = response
      .json()
      .await
      .map_err(|_| eyre!("Invalid response"))?;
    body.into_confirmation()
  }
}

fn parse_base_url(raw: &str) -> Result<Url> {
  let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid API base URL {}: {}", raw, e))?;
  // Without the trailing slash `join` would replace the last path segment
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

fn join_endpoint(base_url: &Url, path: &str) -> Result<Url> {
  base_url
    .join(path.trim_start_matches('/'))
    .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))
}

/// Collections come either wrapped as `{ "data": [...] }` or as a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum CollectionBody<T> {
  Wrapped { data: Option<Vec<T>> },
  Bare(Vec<T>),
  Empty(()),
}

fn parse_collection<T: DeserializeOwned>(body: Value) -> serde_json::Result<Vec<T>> {
  Ok(match serde_json::from_value(body)? {
    CollectionBody::Wrapped { data } => data.unwrap_or_default(),
    CollectionBody::Bare(items) => items,
    CollectionBody::Empty(()) => Vec::new(),
  })
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
  batch_id: &'a str,
  ops: Vec<BatchOp>,
}

#[derive(Debug, PartialEq, Serialize)]
struct BatchOp {
  request_id: String,
  entity: String,
  op: QueueOperation,
  #[serde(skip_serializing_if = "Option::is_none")]
  local_id: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  remote_id: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  if_match_version: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  data: Option<Value>,
}

impl BatchOp {
  fn from_item(item: &SyncQueueItem) -> Result<Self> {
    let mut op = Self {
      request_id: item.request_id.clone(),
      entity: item.table_name.clone(),
      op: item.operation,
      local_id: None,
      remote_id: None,
      if_match_version: None,
      data: None,
    };

    match item.operation {
      QueueOperation::Create => {
        op.local_id = item.local_temp_id.map(|id| id.raw());
        op.data = Some(item.payload()?);
      }
      QueueOperation::Update => {
        let mut data: Value = item.payload()?;
        op.remote_id = item.record_id;
        // The version guard travels next to the data, not inside it
        op.if_match_version = data
          .as_object_mut()
          .and_then(|fields| fields.remove("if_match_version"));
        op.data = Some(data);
      }
      QueueOperation::Delete => {
        op.remote_id = item.record_id;
      }
    }

    Ok(op)
  }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
  #[serde(default)]
  ok: bool,
  #[serde(default)]
  results: Vec<BatchResult>,
}

#[derive(Debug, Deserialize)]
struct BatchResult {
  status: String,
  remote_id: Option<i64>,
  version: Option<i64>,
}

impl BatchResponse {
  fn into_confirmation(self) -> Result<Confirmation> {
    match self.results.into_iter().next() {
      Some(result) if self.ok && result.status == "done" => Ok(Confirmation {
        remote_id: result.remote_id,
        version: result.version,
      }),
      _ => Err(eyre!("Invalid response")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::{Database, NewQueueItem};
  use crate::offline::EntityId;
  use serde_json::json;

  #[derive(Debug, PartialEq, Deserialize)]
  struct Account {
    id: i64,
    name: String,
  }

  #[test]
  fn test_base_url_gets_trailing_slash() {
    let base = parse_base_url("https://api.example.com/v1").unwrap();
    assert_eq!(
      join_endpoint(&base, "accounts").unwrap().as_str(),
      "https://api.example.com/v1/accounts"
    );
    assert_eq!(
      join_endpoint(&base, "/sync/batch").unwrap().as_str(),
      "https://api.example.com/v1/sync/batch"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(parse_base_url("not a url").is_err());
  }

  #[test]
  fn test_collection_shapes() {
    let wrapped: Vec<Account> = parse_collection(json!({ "data": [{ "id": 1, "name": "Caja" }] })).unwrap();
    let bare: Vec<Account> = parse_collection(json!([{ "id": 1, "name": "Caja" }])).unwrap();
    let empty: Vec<Account> = parse_collection(Value::Null).unwrap();

    assert_eq!(wrapped, bare);
    assert_eq!(wrapped[0].name, "Caja");
    assert!(empty.is_empty());
    assert!(parse_collection::<Account>(json!({ "data": "nope" })).is_err());
  }

  fn queued(db: &Database, item: NewQueueItem) -> SyncQueueItem {
    let id = db.enqueue(item).unwrap();
    db.get_queue_item(id).unwrap().unwrap()
  }

  #[test]
  fn test_create_op_carries_local_id_and_data() {
    let db = Database::open_in_memory().unwrap();
    let temp = EntityId::Temporary(12);
    let item = queued(
      &db,
      NewQueueItem::new("clients", QueueOperation::Create, json!({ "name": "Acme" }))
        .with_temp_id(temp)
        .with_request_id("req-1"),
    );

    let op = BatchOp::from_item(&item).unwrap();
    assert_eq!(
      serde_json::to_value(&op).unwrap(),
      json!({
        "request_id": "req-1",
        "entity": "clients",
        "op": "create",
        "local_id": -12,
        "data": { "name": "Acme" },
      })
    );
  }

  #[test]
  fn test_update_op_lifts_version_guard() {
    let db = Database::open_in_memory().unwrap();
    let item = queued(
      &db,
      NewQueueItem::new(
        "clients",
        QueueOperation::Update,
        json!({ "name": "Beta", "if_match_version": 3 }),
      )
      .with_record_id(8),
    );

    let op = BatchOp::from_item(&item).unwrap();
    assert_eq!(op.remote_id, Some(8));
    assert_eq!(op.if_match_version, Some(json!(3)));
    assert_eq!(op.data, Some(json!({ "name": "Beta" })));
  }

  #[test]
  fn test_delete_op_has_no_data() {
    let db = Database::open_in_memory().unwrap();
    let item = queued(
      &db,
      NewQueueItem::new("clients", QueueOperation::Delete, json!({})).with_record_id(5),
    );

    let op = BatchOp::from_item(&item).unwrap();
    assert_eq!(op.remote_id, Some(5));
    assert!(op.data.is_none());
    assert!(op.local_id.is_none());
  }

  #[test]
  fn test_batch_response_confirmation() {
    let done: BatchResponse =
      serde_json::from_value(json!({ "ok": true, "results": [{ "status": "done", "remote_id": 41, "version": 1 }] }))
        .unwrap();
    assert_eq!(
      done.into_confirmation().unwrap(),
      Confirmation {
        remote_id: Some(41),
        version: Some(1),
      }
    );

    let conflict: BatchResponse =
      serde_json::from_value(json!({ "ok": true, "results": [{ "status": "conflict" }] })).unwrap();
    assert_eq!(conflict.into_confirmation().unwrap_err().to_string(), "Invalid response");

    let empty: BatchResponse = serde_json::from_value(json!({ "ok": false })).unwrap();
    assert!(empty.into_confirmation().is_err());
  }
}
