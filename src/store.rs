//src/store.rs

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use std::fmt::Write as FmtWrite;

use crate::config::HeatmapConfig;
use crate::error::{HeatmapError, Result};

/// Client side of the search-store protocol. One instance is built at startup and shared.
pub trait SearchStoreClient: Send + Sync {
    /// Runs one search request and returns the raw response body.
    fn search(&self, index: &str, body: &Value) -> Result<Value>;

    /// Partial document updates. Per-item failures are reported in the outcome, not as `Err`.
    fn bulk_update(&self, index: &str, updates: &[BulkUpdate]) -> Result<BulkOutcome>;
}

/// One partial update, keyed by document id.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdate {
    pub id: String,
    pub doc: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub items: Vec<BulkItemResult>,
}

impl BulkOutcome {
    /// Parses a `_bulk` response body.
    pub fn from_response(body: &Value) -> Result<Self> {
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| HeatmapError::MalformedResponse("bulk response without items".into()))?;

        let items = items
            .iter()
            .map(|item| {
                // each item is keyed by its action: {"update": {...}}
                let inner = item
                    .as_object()
                    .and_then(|o| o.values().next())
                    .cloned()
                    .unwrap_or(Value::Null);
                BulkItemResult {
                    id: inner
                        .get("_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: inner.get("status").and_then(Value::as_u64).unwrap_or(0) as u16,
                    error: inner.get("error").map(|e| match e {
                        Value::String(s) => s.clone(),
                        other => other
                            .get("reason")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| other.to_string()),
                    }),
                }
            })
            .collect();
        Ok(Self { items })
    }

    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items
            .iter()
            .filter(|item| item.error.is_some() || item.status >= 300)
    }
}

/// Renders bulk updates as the newline-delimited body `_bulk` expects.
pub fn bulk_body(index: &str, updates: &[BulkUpdate]) -> Result<String> {
    let mut body = String::new();
    for update in updates {
        let action = json!({ "update": { "_index": index, "_id": update.id } });
        let doc = json!({ "doc": update.doc });
        writeln!(body, "{}", serde_json::to_string(&action)?)
            .map_err(|e| HeatmapError::Store(e.to_string()))?;
        writeln!(body, "{}", serde_json::to_string(&doc)?)
            .map_err(|e| HeatmapError::Store(e.to_string()))?;
    }
    Ok(body)
}

/// REST client for the search store. Errors propagate on first failure; no retry here.
pub struct HttpSearchClient {
    base_url: String,
    client: Client,
}

impl HttpSearchClient {
    pub fn new(config: &HeatmapConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            base_url: config.es_address.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn post(&self, url: &str, content_type: &str, body: String) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(HeatmapError::Store(format!(
                "{url} returned {status}: {}",
                text.trim()
            )));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

impl SearchStoreClient for HttpSearchClient {
    fn search(&self, index: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}/_search", self.base_url, index);
        log::debug!("POST {url}");
        self.post(&url, "application/json", serde_json::to_string(body)?)
    }

    fn bulk_update(&self, index: &str, updates: &[BulkUpdate]) -> Result<BulkOutcome> {
        if updates.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let url = format!("{}/_bulk", self.base_url);
        let response = self.post(&url, "application/x-ndjson", bulk_body(index, updates)?)?;
        BulkOutcome::from_response(&response)
    }
}
