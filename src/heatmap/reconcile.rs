use ahash::AHashSet;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::HeatmapConfig;
use crate::error::{HeatmapError, Result};
use crate::fetch::{batch_ids, response_hits};
use crate::invoke::{invoke_with_retry, item_failures, FunctionInvoker, RetryPolicy};
use crate::query::{QueryClause, SearchRequest, SourceFilter};
use crate::store::{BulkUpdate, SearchStoreClient};
use crate::types::{BackgroundId, RunId};

/// Index state of one (run, background) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Unknown,
    Present,
    Missing,
}

impl IndexState {
    /// Applies the outcome of a completeness lookup. Resolved states are final.
    pub fn resolve(self, complete: bool) -> Self {
        match self {
            IndexState::Unknown if complete => IndexState::Present,
            IndexState::Unknown => IndexState::Missing,
            resolved => resolved,
        }
    }
}

/// Document id of a (run, background) pair in the run-status index.
pub fn run_status_id(run_id: RunId, background_id: BackgroundId) -> String {
    format!("{run_id}_{background_id}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Makes sure every requested (run, background) pair is indexed before it is read.
pub struct Reconciler {
    store: Arc<dyn SearchStoreClient>,
    invoker: Arc<dyn FunctionInvoker>,
    run_status_index: String,
    indexing_function: String,
    eviction_function: String,
    retry: RetryPolicy,
    window: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SearchStoreClient>,
        invoker: Arc<dyn FunctionInvoker>,
        config: &HeatmapConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            run_status_index: config.run_status_index.clone(),
            indexing_function: config.indexing_function.clone(),
            eviction_function: config.eviction_function.clone(),
            retry: RetryPolicy::from_config(config),
            window: config.max_result_window,
        }
    }

    /// Resolves `Unknown` to `Present` or `Missing` for each run, in input order.
    ///
    /// One unpaged query per chunk, sized to the chunk, so chunks never exceed the window.
    pub fn index_states(
        &self,
        run_ids: &[RunId],
        background_id: BackgroundId,
    ) -> Result<Vec<(RunId, IndexState)>> {
        let mut present = AHashSet::new();
        for chunk in batch_ids(run_ids, self.window) {
            let request = SearchRequest::new(vec![
                QueryClause::terms("pipeline_run_id", chunk.iter().copied()),
                QueryClause::term("background_id", background_id),
                QueryClause::term("is_complete", true),
            ])
            .source(SourceFilter::Fields(vec!["pipeline_run_id".to_string()]))
            .size(chunk.len());

            let response = self.store.search(&self.run_status_index, &request.to_wire())?;
            for hit in response_hits(&response)? {
                if let Some(run_id) = hit
                    .get("_source")
                    .and_then(|s| s.get("pipeline_run_id"))
                    .and_then(Value::as_u64)
                {
                    present.insert(run_id);
                }
            }
        }

        Ok(run_ids
            .iter()
            .map(|run_id| (*run_id, IndexState::Unknown.resolve(present.contains(run_id))))
            .collect())
    }

    /// Runs with no complete index entry for `background_id`.
    pub fn find_missing(&self, run_ids: &[RunId], background_id: BackgroundId) -> Result<Vec<RunId>> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .index_states(run_ids, background_id)?
            .into_iter()
            .filter(|(_, state)| *state == IndexState::Missing)
            .map(|(run_id, _)| run_id)
            .collect())
    }

    /// Triggers the indexing job for every missing run in one batched call.
    ///
    /// Returns the runs that were sent for indexing. Any per-item failure fails the
    /// whole batch. Newly indexed data may not be visible to reads right away.
    pub fn ensure_indexed(&self, run_ids: &[RunId], background_id: BackgroundId) -> Result<Vec<RunId>> {
        let missing = self.find_missing(run_ids, background_id)?;
        if missing.is_empty() {
            return Ok(missing);
        }
        log::info!(
            "{} of {} run(s) missing from the index for background {background_id}; invoking {}",
            missing.len(),
            run_ids.len(),
            self.indexing_function
        );

        let payload = json!({ "background_id": background_id, "pipeline_run_ids": missing });
        self.invoke_batch(&self.indexing_function, &payload)?;
        Ok(missing)
    }

    /// Asks the eviction job to drop the given runs from the index.
    pub fn evict(&self, run_ids: &[RunId]) -> Result<()> {
        if run_ids.is_empty() {
            return Ok(());
        }
        log::info!("Evicting {} run(s) via {}", run_ids.len(), self.eviction_function);
        let payload = json!({ "pipeline_run_ids": run_ids });
        self.invoke_batch(&self.eviction_function, &payload)
    }

    fn invoke_batch(&self, function_name: &str, payload: &Value) -> Result<()> {
        let response = invoke_with_retry(self.invoker.as_ref(), function_name, payload, self.retry)?;
        let failures = item_failures(&response);
        if !failures.is_empty() {
            return Err(HeatmapError::BatchIndexingFailed {
                function: function_name.to_string(),
                failures,
            });
        }
        Ok(())
    }

    /// Best-effort `last_read_at` refresh for the read pairs. Never fails.
    pub fn touch_last_read(&self, run_ids: &[RunId], background_id: BackgroundId) {
        let now = now_millis();
        for chunk in batch_ids(run_ids, self.window) {
            let updates: Vec<BulkUpdate> = chunk
                .iter()
                .map(|run_id| BulkUpdate {
                    id: run_status_id(*run_id, background_id),
                    doc: json!({ "last_read_at": now }),
                })
                .collect();

            match self.store.bulk_update(&self.run_status_index, &updates) {
                Ok(outcome) => {
                    for failure in outcome.failures() {
                        log::warn!(
                            "Failed to update last_read_at for {}: {}",
                            failure.id,
                            failure.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
                Err(e) => log::warn!("last_read_at bulk update failed: {e}"),
            }
        }
    }
}
