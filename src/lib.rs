// src/lib.rs
pub mod config;
pub mod error;
pub mod fetch;
pub mod files;
pub mod filters;
pub mod heatmap;
pub mod invoke;
pub mod pathogens;
pub mod query;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

use ahash::{AHashMap, AHashSet};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::io::Write;

use crate::error::Result;
use crate::filters::{FilterSpec, HeatmapParams};
use crate::heatmap::HeatmapService;
use crate::types::{AggregatedSampleResult, CountType, PresentedMetrics, RunId, SampleId, SampleInfo};

/// Metric columns of the compact layout, in order.
pub const RESULT_KEYS: [&str; 7] = [
    "r",
    "rpm",
    "zscore",
    "percentidentity",
    "alignmentlength",
    "logevalue",
    "maxzscore",
];

/// A sample plus the run whose results represent it.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleRequest {
    #[serde(flatten)]
    pub sample: SampleInfo,
    #[serde(default)]
    pub pipeline_run_id: Option<RunId>,
}

/// A heatmap request as read from JSON: the samples and the wire parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeatmapRequest {
    #[serde(default)]
    pub samples: Vec<SampleRequest>,
    #[serde(default)]
    pub params: HeatmapParams,
}

impl HeatmapRequest {
    pub fn sample_infos(&self) -> Vec<SampleInfo> {
        self.samples.iter().map(|s| s.sample.clone()).collect()
    }

    pub fn run_to_sample(&self) -> AHashMap<RunId, SampleId> {
        self.samples
            .iter()
            .filter_map(|s| s.pipeline_run_id.map(|run| (run, s.sample.sample_id)))
            .collect()
    }
}

/// Heatmap results; the structured data is kept and renderings are produced on demand.
pub struct HeatmapResults {
    pub samples: Vec<AggregatedSampleResult>,
}

impl HeatmapResults {
    pub fn get_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.samples)?)
    }

    /// Long format: one line per sample × taxon × count type.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec![
            "sample_id",
            "sample_name",
            "pipeline_run_id",
            "tax_id",
            "tax_level",
            "name",
            "common_name",
            "count_type",
        ];
        header.extend(RESULT_KEYS);
        header.push("filtered");
        wtr.write_record(&header)?;

        for sample in &self.samples {
            for taxon in &sample.taxons {
                for count_type in CountType::PRESENTED {
                    let Some(metrics) = taxon.metrics(count_type) else {
                        continue;
                    };
                    let mut record = vec![
                        sample.sample_id.to_string(),
                        sample.name.clone(),
                        sample.pipeline_run_id.map(|r| r.to_string()).unwrap_or_default(),
                        taxon.tax_id.to_string(),
                        taxon.tax_level.code().to_string(),
                        taxon.name.clone().unwrap_or_default(),
                        taxon.common_name.clone().unwrap_or_default(),
                        count_type.to_string(),
                    ];
                    record.extend(
                        RESULT_KEYS
                            .iter()
                            .map(|key| metrics.get(key).map(|v| v.to_string()).unwrap_or_default()),
                    );
                    record.push(taxon.filtered.to_string());
                    wtr.write_record(&record)?;
                }
            }
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn get_csv(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Compact layout: `samples`, unique `taxa`, `result_keys`, and `results`
    /// indexed by sample id, then tax id, then count type.
    pub fn get_compact(&self) -> Value {
        let mut samples = Vec::with_capacity(self.samples.len());
        let mut taxa = Vec::new();
        let mut seen_taxa = AHashSet::new();
        let mut results = Map::new();

        for sample in &self.samples {
            samples.push(json!({
                "id": sample.sample_id,
                "name": sample.name,
                "metadata": sample.metadata,
                "host_genome_name": sample.host_genome_name,
                "pipeline_run": {
                    "id": sample.pipeline_run_id,
                    "pipeline_version": sample.pipeline_version,
                    "ercc_count": sample.ercc_count,
                },
            }));

            let mut by_taxon = Map::new();
            for taxon in &sample.taxons {
                if seen_taxa.insert(taxon.tax_id) {
                    taxa.push(json!({
                        "tax_id": taxon.tax_id,
                        "name": taxon.name,
                        "common_name": taxon.common_name,
                        "tax_level": taxon.tax_level,
                        "genus_tax_id": taxon.genus_taxid,
                        "superkingdom_tax_id": taxon.superkingdom_taxid,
                        "is_phage": taxon.is_phage,
                    }));
                }
                let mut by_count_type = Map::new();
                for count_type in CountType::PRESENTED {
                    if let Some(metrics) = taxon.metrics(count_type) {
                        by_count_type.insert(count_type.to_string(), metric_values(metrics));
                    }
                }
                by_taxon.insert(taxon.tax_id.to_string(), Value::Object(by_count_type));
            }
            results.insert(sample.sample_id.to_string(), Value::Object(by_taxon));
        }

        json!({
            "samples": samples,
            "taxa": taxa,
            "result_keys": RESULT_KEYS,
            "results": results,
        })
    }
}

fn metric_values(metrics: &PresentedMetrics) -> Value {
    Value::Array(RESULT_KEYS.iter().map(|key| json!(metrics.get(key))).collect())
}

/// Top-N heatmap for a decoded request.
pub fn generate_heatmap(service: &HeatmapService, request: &HeatmapRequest) -> Result<HeatmapResults> {
    let spec = FilterSpec::from_params(&request.params, service.config())?;
    let samples = service.generate(&request.sample_infos(), &request.run_to_sample(), &spec)?;
    Ok(HeatmapResults { samples })
}

/// Heatmap restricted to the request's `taxonIds`.
pub fn generate_taxa_details(service: &HeatmapService, request: &HeatmapRequest) -> Result<HeatmapResults> {
    let spec = FilterSpec::from_params(&request.params, service.config())?;
    let samples = service.taxa_details(&request.sample_infos(), &request.run_to_sample(), &spec)?;
    Ok(HeatmapResults { samples })
}
