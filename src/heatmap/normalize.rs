use ahash::AHashMap;
use std::cmp::Ordering;

use crate::filters::{apply_threshold_filters, external_alias, ThresholdFilter};
use crate::types::{
    AggregatedSampleResult, CountType, MetricBundle, PresentedMetrics, RunId, SampleId, SampleInfo,
    TaxonMetricRecord, TaxonRow,
};

/// Z-score given to a count type the taxon has no bundle for.
pub const ABSENT_ZSCORE: f64 = -100.0;

/// Rounds to 4 decimal places. `None` stays `None`.
pub fn round4(value: Option<f64>) -> Option<f64> {
    value.map(|v| (v * 10_000.0).round() / 10_000.0)
}

fn set_metric(metrics: &mut PresentedMetrics, alias: &str, value: Option<f64>) {
    match alias {
        "r" => metrics.r = round4(value),
        "rpm" => metrics.rpm = round4(value),
        "zscore" => metrics.zscore = round4(value),
        "percentidentity" => metrics.percentidentity = value,
        "alignmentlength" => metrics.alignmentlength = value,
        "logevalue" => metrics.logevalue = value,
        _ => {}
    }
}

/// Renames a stored bundle to its presentation aliases and rounds `r`, `rpm`, `zscore`.
pub fn present_bundle(bundle: &MetricBundle) -> PresentedMetrics {
    let mut metrics = PresentedMetrics::default();
    let fields = [
        ("counts", bundle.counts),
        ("rpm", bundle.rpm),
        ("zscore", bundle.zscore),
        ("percent_identity", bundle.percent_identity),
        ("alignment_length", bundle.alignment_length),
        ("e_value", bundle.e_value),
    ];
    for (internal, value) in fields {
        if let Some(alias) = external_alias(internal) {
            set_metric(&mut metrics, alias, value);
        }
    }
    metrics
}

fn absent_metrics() -> PresentedMetrics {
    PresentedMetrics {
        zscore: Some(ABSENT_ZSCORE),
        ..PresentedMetrics::default()
    }
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// One output row from one stored record. Merged bundles are dropped.
pub fn normalize_record(record: &TaxonMetricRecord, filters: &[ThresholdFilter]) -> TaxonRow {
    let mut nt = None;
    let mut nr = None;
    for bundle in &record.metric_list {
        match bundle.count_type {
            CountType::Nt => nt = Some(present_bundle(bundle)),
            CountType::Nr => nr = Some(present_bundle(bundle)),
            CountType::MergedNtNr => {}
        }
    }
    let mut nt = nt.unwrap_or_else(absent_metrics);
    let mut nr = nr.unwrap_or_else(absent_metrics);

    // per-taxon score, stored on both count types
    let max_zscore = max_option(nt.zscore, nr.zscore);
    nt.maxzscore = max_zscore;
    nr.maxzscore = max_zscore;

    let mut row = TaxonRow {
        tax_id: record.tax_id,
        tax_level: record.tax_level,
        genus_taxid: record.genus_taxid,
        superkingdom_taxid: record.superkingdom_taxid,
        is_phage: record.is_phage,
        name: record.name.clone(),
        common_name: record.common_name.clone(),
        nt,
        nr,
        filtered: false,
    };
    row.filtered = apply_threshold_filters(&row, filters);
    row
}

/// Highest `max_zscore` first (absent last), then ascending `tax_id`.
fn compare_rows(a: &TaxonRow, b: &TaxonRow) -> Ordering {
    let by_score = match (a.max_zscore(), b.max_zscore()) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_score.then(a.tax_id.cmp(&b.tax_id))
}

/// Groups records by run, maps runs to their samples, and emits one result per sample.
///
/// Samples come out in input order; samples without a run or without records still
/// appear with an empty taxon list. Records of unknown runs are skipped.
pub fn normalize_results(
    samples: &[SampleInfo],
    run_to_sample: &AHashMap<RunId, SampleId>,
    records: &[TaxonMetricRecord],
    filters: &[ThresholdFilter],
) -> Vec<AggregatedSampleResult> {
    let mut rows_by_run: AHashMap<RunId, Vec<TaxonRow>> = AHashMap::new();
    for record in records {
        if !run_to_sample.contains_key(&record.pipeline_run_id) {
            log::debug!(
                "Skipping record for unmapped run {} (taxon {})",
                record.pipeline_run_id,
                record.tax_id
            );
            continue;
        }
        rows_by_run
            .entry(record.pipeline_run_id)
            .or_default()
            .push(normalize_record(record, filters));
    }

    let mut run_by_sample: AHashMap<SampleId, RunId> = AHashMap::with_capacity(run_to_sample.len());
    for (run_id, sample_id) in run_to_sample {
        run_by_sample.insert(*sample_id, *run_id);
    }

    samples
        .iter()
        .map(|sample| {
            let pipeline_run_id = run_by_sample.get(&sample.sample_id).copied();
            let mut taxons = pipeline_run_id
                .and_then(|run_id| rows_by_run.remove(&run_id))
                .unwrap_or_default();
            taxons.sort_by(compare_rows);
            // Samples with no taxa report no spike-ins.
            let ercc_count = if taxons.is_empty() {
                0
            } else {
                sample.ercc_count.unwrap_or(0)
            };
            AggregatedSampleResult {
                sample_id: sample.sample_id,
                pipeline_run_id,
                name: sample.name.clone(),
                metadata: sample.metadata.clone(),
                host_genome_name: sample.host_genome_name.clone(),
                pipeline_version: sample.pipeline_version.clone(),
                ercc_count,
                taxons,
            }
        })
        .collect()
}
