//src/testing.rs
//! In-memory fakes for the store and the function invoker.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cmp::Ordering;

use crate::error::Result;
use crate::invoke::FunctionInvoker;
use crate::store::{BulkItemResult, BulkOutcome, BulkUpdate, SearchStoreClient};

type SearchHandler = Box<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>;
type InvokeHandler = Box<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>;

pub fn hit(source: Value, sort: Value) -> Value {
    json!({ "_source": source, "sort": sort })
}

/// Store fake answering searches with a closure and recording every request.
pub struct FakeStore {
    handler: SearchHandler,
    requests: Mutex<Vec<(String, Value)>>,
    bulk_calls: Mutex<Vec<(String, Vec<BulkUpdate>)>>,
    bulk_failures: Vec<String>,
    bulk_error: bool,
}

impl FakeStore {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            bulk_calls: Mutex::new(Vec::new()),
            bulk_failures: Vec::new(),
            bulk_error: false,
        }
    }

    /// Serves `docs` honoring the request's sort, `size` and `search_after`.
    pub fn paging(docs: Vec<Value>) -> Self {
        Self::new(move |_, body| Ok(page_of(&docs, body)))
    }

    /// Marks the given document ids as failing in bulk updates.
    pub fn with_bulk_failures(mut self, ids: &[&str]) -> Self {
        self.bulk_failures = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Makes every bulk call fail outright.
    pub fn with_bulk_error(mut self) -> Self {
        self.bulk_error = true;
        self
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().clone()
    }

    pub fn bulk_calls(&self) -> Vec<(String, Vec<BulkUpdate>)> {
        self.bulk_calls.lock().clone()
    }
}

impl SearchStoreClient for FakeStore {
    fn search(&self, index: &str, body: &Value) -> Result<Value> {
        self.requests.lock().push((index.to_string(), body.clone()));
        (self.handler)(index, body)
    }

    fn bulk_update(&self, index: &str, updates: &[BulkUpdate]) -> Result<BulkOutcome> {
        self.bulk_calls
            .lock()
            .push((index.to_string(), updates.to_vec()));
        if self.bulk_error {
            return Err(crate::error::HeatmapError::Store("bulk endpoint down".into()));
        }
        Ok(BulkOutcome {
            items: updates
                .iter()
                .map(|u| {
                    let failed = self.bulk_failures.contains(&u.id);
                    BulkItemResult {
                        id: u.id.clone(),
                        status: if failed { 404 } else { 200 },
                        error: failed.then(|| "document missing".to_string()),
                    }
                })
                .collect(),
        })
    }
}

fn sort_fields(body: &Value) -> Vec<String> {
    body.get("sort")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f.as_object().and_then(|o| o.keys().next().cloned()))
                .collect()
        })
        .unwrap_or_default()
}

fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => x.to_string().cmp(&y.to_string()),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Only top-level `term`/`terms` clauses are evaluated; anything else passes.
fn matches_clause(doc: &Value, clause: &Value) -> bool {
    let single = |key: &str| {
        clause
            .get(key)
            .and_then(Value::as_object)
            .and_then(|o| o.iter().next())
    };
    if let Some((field, value)) = single("term") {
        return doc.get(field).is_some_and(|d| same_value(d, value));
    }
    if let Some((field, values)) = single("terms") {
        let values = values.as_array().cloned().unwrap_or_default();
        return doc
            .get(field)
            .is_some_and(|d| values.iter().any(|v| same_value(d, v)));
    }
    true
}

/// One search-after page over `docs`, as the store would serve it for `body`.
pub fn page_of(docs: &[Value], body: &Value) -> Value {
    let fields = sort_fields(body);
    let filters = body["query"]["bool"]["filter"].as_array().cloned().unwrap_or_default();
    let mut keyed: Vec<(Vec<Value>, &Value)> = docs
        .iter()
        .filter(|d| filters.iter().all(|f| matches_clause(d, f)))
        .map(|d| {
            let key = fields
                .iter()
                .map(|f| d.get(f).cloned().unwrap_or(Value::Null))
                .collect();
            (key, d)
        })
        .collect();
    keyed.sort_by(|a, b| compare_keys(&a.0, &b.0));

    let size = body.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
    let after = body.get("search_after").and_then(Value::as_array);
    let hits: Vec<Value> = keyed
        .into_iter()
        .filter(|(key, _)| match after {
            Some(cursor) => compare_keys(key, cursor) == Ordering::Greater,
            None => true,
        })
        .take(size)
        .map(|(key, doc)| hit(doc.clone(), Value::Array(key)))
        .collect();
    json!({ "hits": { "hits": hits } })
}

/// Invoker fake with a scripted response per call, recording calls.
pub struct FakeInvoker {
    handler: InvokeHandler,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeInvoker {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn ok() -> Self {
        Self::new(|_, _| Ok(json!({"status": "ok"})))
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

impl FunctionInvoker for FakeInvoker {
    fn invoke(&self, function_name: &str, payload: &Value) -> Result<Value> {
        let attempt = {
            let mut calls = self.calls.lock();
            calls.push((function_name.to_string(), payload.clone()));
            calls.len()
        };
        log::debug!("fake invocation #{attempt} of {function_name}");
        (self.handler)(function_name, payload)
    }
}
