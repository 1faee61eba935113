use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use std::sync::Arc;

use super::normalize::normalize_results;
use super::reconcile::Reconciler;
use super::top_n::select_top_taxa;
use crate::config::HeatmapConfig;
use crate::error::{HeatmapError, Result};
use crate::fetch::{batch_tax_ids, fetch_all_records, record_sort};
use crate::filters::{build_filter_clauses, parse_threshold_filters, FilterSpec};
use crate::invoke::{invoker_from_config, FunctionInvoker};
use crate::pathogens::PathogenListProvider;
use crate::query::{QueryClause, SearchRequest};
use crate::store::{HttpSearchClient, SearchStoreClient};
use crate::types::{
    AggregatedSampleResult, BackgroundId, RunId, SampleId, SampleInfo, TaxId, TaxLevel,
    TaxonMetricRecord,
};

/// End-to-end heatmap pipeline over one search store.
pub struct HeatmapService {
    store: Arc<dyn SearchStoreClient>,
    pathogens: Arc<dyn PathogenListProvider>,
    reconciler: Reconciler,
    config: HeatmapConfig,
}

impl HeatmapService {
    pub fn new(
        store: Arc<dyn SearchStoreClient>,
        invoker: Arc<dyn FunctionInvoker>,
        pathogens: Arc<dyn PathogenListProvider>,
        config: HeatmapConfig,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone(), invoker, &config);
        Self {
            store,
            pathogens,
            reconciler,
            config,
        }
    }

    /// HTTP store client plus the invoker the deployment mode calls for.
    pub fn from_config(config: HeatmapConfig, pathogens: Arc<dyn PathogenListProvider>) -> Result<Self> {
        let store: Arc<dyn SearchStoreClient> = Arc::new(HttpSearchClient::new(&config)?);
        let invoker = invoker_from_config(&config)?;
        Ok(Self::new(store, invoker, pathogens, config))
    }

    pub fn config(&self) -> &HeatmapConfig {
        &self.config
    }

    /// Heatmap for the top taxa of each sample.
    ///
    /// Missing runs are indexed first; a failed indexing call aborts before any read.
    pub fn generate(
        &self,
        samples: &[SampleInfo],
        run_to_sample: &AHashMap<RunId, SampleId>,
        spec: &FilterSpec,
    ) -> Result<Vec<AggregatedSampleResult>> {
        let run_ids = self.sorted_runs(run_to_sample)?;
        let threshold_filters = parse_threshold_filters(&spec.threshold_filters)?;
        if run_ids.is_empty() {
            return Ok(normalize_results(samples, run_to_sample, &[], &threshold_filters));
        }

        self.reconciler.ensure_indexed(&run_ids, spec.background_id)?;

        let clauses = build_filter_clauses(spec, self.pathogens.as_ref())?;
        let top = select_top_taxa(
            self.store.as_ref(),
            &self.config.taxon_index,
            &run_ids,
            spec,
            &clauses,
            self.config.max_result_window,
        )?;

        let removed: AHashSet<TaxId> = spec.removed_taxon_ids.iter().copied().collect();
        let candidates: Vec<TaxId> = top
            .union
            .into_iter()
            .filter(|tax_id| !removed.contains(tax_id))
            .collect();
        log::info!(
            "{} candidate taxa across {} run(s) for background {}",
            candidates.len(),
            run_ids.len(),
            spec.background_id
        );

        let records = self.fetch_taxon_metrics(
            &run_ids,
            &candidates,
            spec.background_id,
            Some(spec.taxon_level),
        )?;
        self.reconciler.touch_last_read(&run_ids, spec.background_id);

        Ok(normalize_results(samples, run_to_sample, &records, &threshold_filters))
    }

    /// Metrics for an explicit taxon list, skipping top-N selection and thresholds.
    pub fn taxa_details(
        &self,
        samples: &[SampleInfo],
        run_to_sample: &AHashMap<RunId, SampleId>,
        spec: &FilterSpec,
    ) -> Result<Vec<AggregatedSampleResult>> {
        let run_ids = self.sorted_runs(run_to_sample)?;
        let removed: AHashSet<TaxId> = spec.removed_taxon_ids.iter().copied().collect();
        let mut seen = AHashSet::new();
        let taxa: Vec<TaxId> = spec
            .taxon_ids
            .iter()
            .copied()
            .filter(|tax_id| !removed.contains(tax_id) && seen.insert(*tax_id))
            .collect();
        if run_ids.is_empty() || taxa.is_empty() {
            return Ok(normalize_results(samples, run_to_sample, &[], &[]));
        }

        self.reconciler.ensure_indexed(&run_ids, spec.background_id)?;
        let records = self.fetch_taxon_metrics(&run_ids, &taxa, spec.background_id, None)?;
        self.reconciler.touch_last_read(&run_ids, spec.background_id);

        Ok(normalize_results(samples, run_to_sample, &records, &[]))
    }

    /// Every stored record for `run_ids × tax_ids`.
    ///
    /// Taxa are batched so one batch never exceeds the response window; batches are
    /// fetched in parallel, each with search-after pagination.
    pub fn fetch_taxon_metrics(
        &self,
        run_ids: &[RunId],
        tax_ids: &[TaxId],
        background_id: BackgroundId,
        tax_level: Option<TaxLevel>,
    ) -> Result<Vec<TaxonMetricRecord>> {
        if run_ids.is_empty() || tax_ids.is_empty() {
            return Ok(Vec::new());
        }
        let batches = batch_tax_ids(run_ids.len(), tax_ids, self.config.max_result_window)?;
        log::debug!("Fetching metrics in {} taxon batch(es)", batches.len());

        let fetched: Vec<Vec<TaxonMetricRecord>> = batches
            .par_iter()
            .map(|batch| {
                let mut filter = vec![
                    QueryClause::terms("pipeline_run_id", run_ids.iter().copied()),
                    QueryClause::terms("tax_id", batch.iter().copied()),
                    QueryClause::term("background_id", background_id),
                ];
                if let Some(level) = tax_level {
                    filter.push(QueryClause::term("tax_level", level.code()));
                }
                let request = SearchRequest::new(filter).sort(record_sort());
                fetch_all_records(
                    self.store.as_ref(),
                    &self.config.taxon_index,
                    &request,
                    self.config.page_size,
                )
            })
            .collect::<Result<_>>()?;

        Ok(fetched.into_iter().flatten().collect())
    }

    pub fn evict(&self, run_ids: &[RunId]) -> Result<()> {
        self.reconciler.evict(run_ids)
    }

    fn sorted_runs(&self, run_to_sample: &AHashMap<RunId, SampleId>) -> Result<Vec<RunId>> {
        let mut run_ids: Vec<RunId> = run_to_sample.keys().copied().collect();
        if run_ids.len() > self.config.max_result_window {
            return Err(HeatmapError::TooManyRuns {
                count: run_ids.len(),
                max: self.config.max_result_window,
            });
        }
        run_ids.sort_unstable();
        Ok(run_ids)
    }
}
