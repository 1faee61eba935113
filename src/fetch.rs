//src/fetch.rs

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{HeatmapError, Result};
use crate::query::{SearchRequest, SortField};
use crate::store::SearchStoreClient;
use crate::types::TaxId;

/// Sort that totally orders taxon records, as search-after requires.
pub fn record_sort() -> Vec<SortField> {
    vec![
        SortField::asc("tax_id"),
        SortField::asc("pipeline_run_id"),
        SortField::asc("background_id"),
    ]
}

/// Extracts `hits.hits` from a search response.
pub fn response_hits(response: &Value) -> Result<&Vec<Value>> {
    response
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .ok_or_else(|| HeatmapError::MalformedResponse("response has no hits.hits array".into()))
}

/// Retrieves every hit matching `request` using search-after pagination.
///
/// The request must carry a sort. Each page's last sort key is threaded verbatim into
/// the next request; the first empty page ends the scan. Store errors propagate.
pub fn fetch_all_hits(
    store: &dyn SearchStoreClient,
    index: &str,
    request: &SearchRequest,
    page_size: usize,
) -> Result<Vec<Value>> {
    if request.sort.is_empty() {
        return Err(HeatmapError::MissingSort(index.to_string()));
    }

    let mut page_request = request.clone();
    page_request.size = Some(page_size);

    let mut all_hits = Vec::new();
    let mut page = 0usize;
    loop {
        let response = store.search(index, &page_request.to_wire())?;
        let hits = response_hits(&response)?;
        if hits.is_empty() {
            break;
        }

        let cursor = hits
            .last()
            .and_then(|hit| hit.get("sort"))
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| HeatmapError::MissingCursor(index.to_string()))?;

        page += 1;
        log::debug!("{index}: page {page} returned {} hit(s)", hits.len());
        all_hits.extend(hits.iter().cloned());
        page_request.search_after = Some(cursor);
    }

    Ok(all_hits)
}

/// Same as [`fetch_all_hits`], deserializing each hit's `_source`.
pub fn fetch_all_records<T: DeserializeOwned>(
    store: &dyn SearchStoreClient,
    index: &str,
    request: &SearchRequest,
    page_size: usize,
) -> Result<Vec<T>> {
    fetch_all_hits(store, index, request, page_size)?
        .into_iter()
        .map(|mut hit| {
            let source = hit
                .get_mut("_source")
                .map(Value::take)
                .ok_or_else(|| HeatmapError::MalformedResponse("hit without _source".into()))?;
            Ok(serde_json::from_value(source)?)
        })
        .collect()
}

/// Splits `ids` into chunks of at most `max` elements.
pub fn batch_ids<T: Clone>(ids: &[T], max: usize) -> Vec<Vec<T>> {
    ids.chunks(max.max(1)).map(<[T]>::to_vec).collect()
}

/// Splits taxa so each (runs × taxa) batch fits in one response window.
pub fn batch_tax_ids(run_count: usize, tax_ids: &[TaxId], window: usize) -> Result<Vec<Vec<TaxId>>> {
    if run_count > window {
        return Err(HeatmapError::TooManyRuns {
            count: run_count,
            max: window,
        });
    }
    let per_batch = window / run_count.max(1);
    Ok(batch_ids(tax_ids, per_batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryClause;
    use crate::testing::{hit, FakeStore};
    use ahash::AHashSet;
    use serde_json::json;

    fn docs(total: usize) -> Vec<Value> {
        (0..total)
            .map(|i| json!({"tax_id": i as i64, "pipeline_run_id": 1, "background_id": 2}))
            .collect()
    }

    #[test]
    fn pagination_returns_every_record_once() {
        let store = FakeStore::paging(docs(23));
        let request = SearchRequest::new(vec![QueryClause::term("background_id", 2)]).sort(record_sort());
        let hits = fetch_all_hits(&store, "scored_taxon_counts", &request, 5).unwrap();

        assert_eq!(hits.len(), 23);
        let ids: AHashSet<i64> = hits
            .iter()
            .map(|h| h["_source"]["tax_id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids.len(), 23);
        // four full pages, one partial page, one empty page
        assert_eq!(store.requests().len(), 6);

        let requests = store.requests();
        assert!(requests[0].1.get("search_after").is_none());
        assert_eq!(requests[1].1["search_after"], json!([4, 1, 2]));
        assert_eq!(requests[1].1["size"], json!(5));
    }

    #[test]
    fn exact_multiple_of_page_size_still_terminates() {
        let store = FakeStore::paging(docs(10));
        let request = SearchRequest::new(vec![]).sort(record_sort());
        let hits = fetch_all_hits(&store, "idx", &request, 5).unwrap();
        assert_eq!(hits.len(), 10);
        assert_eq!(store.requests().len(), 3);
    }

    #[test]
    fn missing_sort_fails_before_querying() {
        let store = FakeStore::paging(docs(3));
        let request = SearchRequest::new(vec![]);
        let err = fetch_all_hits(&store, "idx", &request, 5).unwrap_err();
        assert!(matches!(err, HeatmapError::MissingSort(_)));
        assert!(store.requests().is_empty());
    }

    #[test]
    fn hit_without_cursor_is_an_error() {
        let store = FakeStore::new(|_, _| Ok(json!({"hits": {"hits": [{"_source": {"tax_id": 1}}]}})));
        let request = SearchRequest::new(vec![]).sort(record_sort());
        let err = fetch_all_hits(&store, "idx", &request, 5).unwrap_err();
        assert!(matches!(err, HeatmapError::MissingCursor(_)));
    }

    #[test]
    fn store_errors_propagate() {
        let store = FakeStore::new(|_, _| Err(HeatmapError::Store("timeout".into())));
        let request = SearchRequest::new(vec![]).sort(record_sort());
        assert!(matches!(
            fetch_all_hits(&store, "idx", &request, 5),
            Err(HeatmapError::Store(_))
        ));
    }

    #[test]
    fn records_deserialize_from_source() {
        #[derive(serde::Deserialize)]
        struct Row {
            tax_id: i64,
        }
        let store = FakeStore::new(|_, body| {
            if body.get("search_after").is_some() {
                Ok(json!({"hits": {"hits": []}}))
            } else {
                Ok(json!({"hits": {"hits": [hit(json!({"tax_id": 9}), json!([9]))]}}))
            }
        });
        let request = SearchRequest::new(vec![]).sort(record_sort());
        let rows: Vec<Row> = fetch_all_records(&store, "idx", &request, 5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tax_id, 9);
    }

    #[test]
    fn batches_respect_window_and_cover_input() {
        let tax_ids: Vec<TaxId> = (-5..1234).collect();
        for (runs, window) in [(1, 10_000), (7, 100), (100, 10_000), (3, 10), (10, 10)] {
            let batches = batch_tax_ids(runs, &tax_ids, window).unwrap();
            assert!(batches.iter().all(|b| !b.is_empty() && b.len() * runs <= window));
            let rejoined: Vec<TaxId> = batches.concat();
            assert_eq!(rejoined, tax_ids);
        }
        assert!(batch_tax_ids(2, &[], 10).unwrap().is_empty());
    }

    #[test]
    fn too_many_runs_is_rejected() {
        let err = batch_tax_ids(10_001, &[1, 2], 10_000).unwrap_err();
        assert!(matches!(err, HeatmapError::TooManyRuns { count: 10_001, max: 10_000 }));
    }

    #[test]
    fn id_batches_are_bounded() {
        let ids: Vec<u64> = (0..25).collect();
        let batches = batch_ids(&ids, 10);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![10, 10, 5]);
        assert_eq!(batches.concat(), ids);
    }
}
