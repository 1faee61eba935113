use ahash::AHashSet;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{HeatmapError, Result};
use crate::fetch::batch_ids;
use crate::filters::{FilterSpec, SortDirection, METRIC_LIST_PATH};
use crate::query::{
    QueryClause, SearchRequest, SortField, SourceFilter, TermsAggregation, TopHitsAggregation,
};
use crate::store::SearchStoreClient;
use crate::types::{RunId, TaxId};

/// Genus id the indexing job assigns to blacklisted taxa; never shown.
pub const BLACKLISTED_GENUS_TAXID: TaxId = -201;

const RUNS_AGGREGATION: &str = "pipeline_runs";
const TOP_TAXA_AGGREGATION: &str = "top_taxa";

/// Top taxa per run, plus their union in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopTaxa {
    pub per_run: BTreeMap<RunId, Vec<TaxId>>,
    pub union: Vec<TaxId>,
}

impl TopTaxa {
    fn push_run(&mut self, run_id: RunId, tax_ids: Vec<TaxId>, seen: &mut AHashSet<TaxId>) {
        for tax_id in &tax_ids {
            if seen.insert(*tax_id) {
                self.union.push(*tax_id);
            }
        }
        self.per_run.entry(run_id).or_default().extend(tax_ids);
    }
}

/// Sort for one bucket: the metric restricted to the sort count type, ties by `tax_id`.
pub fn top_n_sort(spec: &FilterSpec) -> Vec<SortField> {
    let metric = match spec.sort.direction {
        SortDirection::Highest => SortField::desc(spec.sort.field()),
        SortDirection::Lowest => SortField::asc(spec.sort.field()),
    };
    vec![
        metric.nested_in(
            METRIC_LIST_PATH,
            QueryClause::term(
                format!("{METRIC_LIST_PATH}.count_type"),
                spec.sort.count_type.as_str(),
            ),
        ),
        SortField::asc("tax_id"),
    ]
}

/// Bucketed query: group by run, keep the best `taxa_per_sample` taxa per bucket.
pub fn top_n_query(run_ids: &[RunId], spec: &FilterSpec, filter_clauses: &[QueryClause]) -> SearchRequest {
    let mut filter = vec![
        QueryClause::terms("pipeline_run_id", run_ids.iter().copied()),
        QueryClause::term("background_id", spec.background_id),
        QueryClause::term("tax_level", spec.taxon_level.code()),
    ];
    filter.extend(filter_clauses.iter().cloned());

    SearchRequest::new(filter)
        .source(SourceFilter::None)
        .size(0)
        .must_not(vec![QueryClause::term("genus_taxid", BLACKLISTED_GENUS_TAXID)])
        .aggregation(TermsAggregation {
            name: RUNS_AGGREGATION.to_string(),
            field: "pipeline_run_id".to_string(),
            size: run_ids.len(),
            top_hits: Some(TopHitsAggregation {
                name: TOP_TAXA_AGGREGATION.to_string(),
                size: spec.taxa_per_sample,
                sort: top_n_sort(spec),
                source: SourceFilter::Fields(vec!["tax_id".to_string()]),
            }),
        })
}

/// Bucket keys are numbers, or strings when ids are mapped as keywords.
fn bucket_run_id(bucket: &Value) -> Option<RunId> {
    let key = bucket.get("key")?;
    key.as_u64()
        .or_else(|| key.as_str().and_then(|s| s.trim().parse().ok()))
        .or_else(|| {
            bucket
                .get("key_as_string")
                .and_then(Value::as_str)
                .and_then(|s| s.trim().parse().ok())
        })
}

/// Reads `aggregations.pipeline_runs.buckets[].top_taxa.hits.hits[]._source.tax_id`.
pub fn parse_top_n_response(response: &Value) -> Result<Vec<(RunId, Vec<TaxId>)>> {
    let malformed = |what: &str| HeatmapError::MalformedResponse(format!("top-N response: {what}"));

    let buckets = response
        .get("aggregations")
        .and_then(|a| a.get(RUNS_AGGREGATION))
        .and_then(|r| r.get("buckets"))
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("no pipeline_runs buckets"))?;

    buckets
        .iter()
        .map(|bucket| {
            let run_id = bucket_run_id(bucket).ok_or_else(|| malformed("bucket without a run key"))?;
            let hits = bucket
                .get(TOP_TAXA_AGGREGATION)
                .and_then(|t| t.get("hits"))
                .and_then(|h| h.get("hits"))
                .and_then(Value::as_array)
                .ok_or_else(|| malformed("bucket without top_taxa hits"))?;
            let tax_ids = hits
                .iter()
                .map(|hit| {
                    hit.get("_source")
                        .and_then(|s| s.get("tax_id"))
                        .and_then(Value::as_i64)
                        .ok_or_else(|| malformed("hit without tax_id"))
                })
                .collect::<Result<Vec<TaxId>>>()?;
            Ok((run_id, tax_ids))
        })
        .collect()
}

/// Top-N taxa per run.
///
/// Runs are queried in chunks that fit the response window. `taxa_per_sample == 0`
/// returns an empty list for every run without querying. Runs with no matching
/// records map to an empty list.
pub fn select_top_taxa(
    store: &dyn SearchStoreClient,
    index: &str,
    run_ids: &[RunId],
    spec: &FilterSpec,
    filter_clauses: &[QueryClause],
    window: usize,
) -> Result<TopTaxa> {
    let mut top = TopTaxa::default();
    for run_id in run_ids {
        top.per_run.insert(*run_id, Vec::new());
    }
    if spec.taxa_per_sample == 0 || run_ids.is_empty() {
        return Ok(top);
    }

    let mut seen = AHashSet::new();
    for chunk in batch_ids(run_ids, window) {
        let request = top_n_query(&chunk, spec, filter_clauses);
        let response = store.search(index, &request.to_wire())?;
        for (run_id, mut tax_ids) in parse_top_n_response(&response)? {
            // the store honors the size, but the cap must hold regardless
            tax_ids.truncate(spec.taxa_per_sample);
            top.push_run(run_id, tax_ids, &mut seen);
        }
    }

    log::debug!(
        "Top-{} selection over {} run(s) produced {} candidate taxa",
        spec.taxa_per_sample,
        run_ids.len(),
        top.union.len()
    );
    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::decode_sort_by;
    use crate::testing::FakeStore;
    use crate::types::TaxLevel;
    use serde_json::json;

    fn spec(n: usize) -> FilterSpec {
        let mut spec = FilterSpec::new(26, TaxLevel::Species, decode_sort_by("highest_nt_rpm").unwrap());
        spec.taxa_per_sample = n;
        spec
    }

    /// Answers a top-N query with `per_run` taxa for every requested run, honoring the bucket size.
    fn bucketing_store(per_run: i64) -> FakeStore {
        FakeStore::new(move |_, body| {
            let size = body["aggs"]["pipeline_runs"]["aggs"]["top_taxa"]["top_hits"]["size"]
                .as_u64()
                .unwrap() as i64;
            let runs = body["query"]["bool"]["filter"][0]["terms"]["pipeline_run_id"]
                .as_array()
                .unwrap()
                .clone();
            let buckets: Vec<Value> = runs
                .iter()
                .map(|run| {
                    let hits: Vec<Value> = (0..per_run.min(size))
                        .map(|i| json!({"_source": {"tax_id": 1000 + i}}))
                        .collect();
                    json!({"key": run, "top_taxa": {"hits": {"hits": hits}}})
                })
                .collect();
            Ok(json!({"aggregations": {"pipeline_runs": {"buckets": buckets}}}))
        })
    }

    #[test]
    fn query_groups_by_run_and_sorts_nested_metric() {
        let body = top_n_query(&[7, 8], &spec(15), &[QueryClause::term("is_phage", 0)]).to_wire();
        assert_eq!(body["_source"], json!(false));
        assert_eq!(body["size"], json!(0));
        let filter = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filter[0], json!({"terms": {"pipeline_run_id": [7, 8]}}));
        assert_eq!(filter[1], json!({"term": {"background_id": 26}}));
        assert_eq!(filter[2], json!({"term": {"tax_level": 1}}));
        assert_eq!(filter[3], json!({"term": {"is_phage": 0}}));
        assert_eq!(
            body["query"]["bool"]["must_not"],
            json!([{"term": {"genus_taxid": -201}}])
        );

        let runs = &body["aggs"]["pipeline_runs"];
        assert_eq!(runs["terms"], json!({"field": "pipeline_run_id", "size": 2}));
        let top_hits = &runs["aggs"]["top_taxa"]["top_hits"];
        assert_eq!(top_hits["size"], json!(15));
        assert_eq!(top_hits["_source"], json!(["tax_id"]));
        assert_eq!(
            top_hits["sort"],
            json!([
                {"metric_list.rpm": {"order": "desc", "nested": {
                    "path": "metric_list",
                    "filter": {"term": {"metric_list.count_type": "NT"}}
                }}},
                {"tax_id": {"order": "asc"}}
            ])
        );
    }

    #[test]
    fn lowest_sort_is_ascending() {
        let mut s = spec(5);
        s.sort = decode_sort_by("lowest_nr_zscore").unwrap();
        let sort = top_n_sort(&s);
        assert_eq!(
            sort[0].to_wire()["metric_list.zscore"]["order"],
            json!("asc")
        );
    }

    #[test]
    fn selection_is_capped_at_n() {
        let store = bucketing_store(500);
        let top = select_top_taxa(&store, "scored_taxon_counts", &[1], &spec(15), &[], 10_000).unwrap();
        assert_eq!(top.per_run[&1].len(), 15);
        assert_eq!(top.union.len(), 15);
    }

    #[test]
    fn zero_n_returns_empty_lists_without_querying() {
        let store = bucketing_store(500);
        let top = select_top_taxa(&store, "scored_taxon_counts", &[1, 2], &spec(0), &[], 10_000).unwrap();
        assert_eq!(top.per_run.len(), 2);
        assert!(top.per_run.values().all(Vec::is_empty));
        assert!(top.union.is_empty());
        assert!(store.requests().is_empty());
    }

    #[test]
    fn runs_without_matches_contribute_nothing() {
        let store = FakeStore::new(|_, _| {
            Ok(json!({"aggregations": {"pipeline_runs": {"buckets": [
                {"key": 1, "top_taxa": {"hits": {"hits": [
                    {"_source": {"tax_id": 573}}, {"_source": {"tax_id": 1280}}
                ]}}},
                {"key": 2, "top_taxa": {"hits": {"hits": [{"_source": {"tax_id": 573}}]}}}
            ]}}}))
        });
        let top = select_top_taxa(&store, "idx", &[1, 2, 3], &spec(10), &[], 10_000).unwrap();
        assert_eq!(top.per_run[&1], vec![573, 1280]);
        assert_eq!(top.per_run[&2], vec![573]);
        assert!(top.per_run[&3].is_empty());
        assert_eq!(top.union, vec![573, 1280]);
    }

    #[test]
    fn runs_are_chunked_to_the_window() {
        let store = bucketing_store(1);
        let runs: Vec<RunId> = (0..25).collect();
        let top = select_top_taxa(&store, "idx", &runs, &spec(3), &[], 10).unwrap();
        assert_eq!(store.requests().len(), 3);
        assert_eq!(top.per_run.len(), 25);
        assert_eq!(top.union, vec![1000]);
    }

    #[test]
    fn keyword_bucket_keys_are_parsed() {
        let response = json!({"aggregations": {"pipeline_runs": {"buckets": [
            {"key": "7", "top_taxa": {"hits": {"hits": [{"_source": {"tax_id": 573}}]}}},
            {"key": 8, "top_taxa": {"hits": {"hits": []}}}
        ]}}});
        assert_eq!(
            parse_top_n_response(&response).unwrap(),
            vec![(7, vec![573]), (8, vec![])]
        );
    }

    #[test]
    fn malformed_response_is_an_error() {
        let store = FakeStore::new(|_, _| Ok(json!({"hits": {"hits": []}})));
        let err = select_top_taxa(&store, "idx", &[1], &spec(3), &[], 10_000).unwrap_err();
        assert!(matches!(err, HeatmapError::MalformedResponse(_)));
    }
}
