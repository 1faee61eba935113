//src/types.rs

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::HeatmapError;

pub type RunId = u64;
pub type SampleId = u64;
pub type BackgroundId = u64;
/// Signed: negative ids are synthetic/unassigned buckets.
pub type TaxId = i64;

/// The two alignment channels, plus the merged channel that only exists in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CountType {
    #[serde(rename = "NT")]
    Nt,
    #[serde(rename = "NR")]
    Nr,
    #[serde(rename = "merged_NT_NR")]
    MergedNtNr,
}

impl CountType {
    /// Count types surfaced to callers.
    pub const PRESENTED: [CountType; 2] = [CountType::Nt, CountType::Nr];

    pub fn as_str(&self) -> &'static str {
        match self {
            CountType::Nt => "NT",
            CountType::Nr => "NR",
            CountType::MergedNtNr => "merged_NT_NR",
        }
    }
}

impl fmt::Display for CountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CountType {
    type Err = HeatmapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NT" => Ok(CountType::Nt),
            "NR" => Ok(CountType::Nr),
            "MERGED_NT_NR" => Ok(CountType::MergedNtNr),
            _ => Err(HeatmapError::UnknownCountType(s.to_string())),
        }
    }
}

/// Taxonomic level, stored in the index as `1` (species) or `2` (genus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TaxLevel {
    Species,
    Genus,
}

impl TaxLevel {
    pub fn code(&self) -> u8 {
        match self {
            TaxLevel::Species => 1,
            TaxLevel::Genus => 2,
        }
    }
}

impl TryFrom<u8> for TaxLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TaxLevel::Species),
            2 => Ok(TaxLevel::Genus),
            other => Err(format!("invalid tax_level {other}")),
        }
    }
}

impl From<TaxLevel> for u8 {
    fn from(level: TaxLevel) -> u8 {
        level.code()
    }
}

/// One per-count-type metric bundle as stored in the index (internal field names).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBundle {
    pub count_type: CountType,
    #[serde(default)]
    pub counts: Option<f64>,
    #[serde(default)]
    pub rpm: Option<f64>,
    #[serde(default)]
    pub zscore: Option<f64>,
    #[serde(default)]
    pub percent_identity: Option<f64>,
    #[serde(default)]
    pub alignment_length: Option<f64>,
    #[serde(default)]
    pub e_value: Option<f64>,
}

/// One indexed row per (run, taxon, background).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonMetricRecord {
    pub pipeline_run_id: RunId,
    pub tax_id: TaxId,
    pub tax_level: TaxLevel,
    pub background_id: BackgroundId,
    #[serde(default)]
    pub genus_taxid: Option<TaxId>,
    #[serde(default)]
    pub superkingdom_taxid: Option<TaxId>,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub is_phage: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub metric_list: Vec<MetricBundle>,
}

/// The index stores `is_phage` as 0/1; older documents carry a JSON bool.
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected bool or integer for is_phage, got {other}"
        ))),
    }
}

/// Caller-supplied sample identity and metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    pub sample_id: SampleId,
    pub name: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub host_genome_name: Option<String>,
    #[serde(default)]
    pub pipeline_version: Option<String>,
    #[serde(default)]
    pub ercc_count: Option<u64>,
}

/// Presentation-named metrics for one count type of one taxon row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresentedMetrics {
    pub r: Option<f64>,
    pub rpm: Option<f64>,
    pub zscore: Option<f64>,
    pub percentidentity: Option<f64>,
    pub alignmentlength: Option<f64>,
    pub logevalue: Option<f64>,
    pub maxzscore: Option<f64>,
}

impl PresentedMetrics {
    /// Looks a metric up by its presentation alias (`r`, `rpm`, `zscore`, ...).
    pub fn get(&self, alias: &str) -> Option<f64> {
        match alias {
            "r" => self.r,
            "rpm" => self.rpm,
            "zscore" => self.zscore,
            "percentidentity" => self.percentidentity,
            "alignmentlength" => self.alignmentlength,
            "logevalue" => self.logevalue,
            "maxzscore" => self.maxzscore,
            _ => None,
        }
    }
}

/// One taxon in one sample, NT and NR merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonRow {
    pub tax_id: TaxId,
    pub tax_level: TaxLevel,
    pub genus_taxid: Option<TaxId>,
    pub superkingdom_taxid: Option<TaxId>,
    pub is_phage: bool,
    pub name: Option<String>,
    pub common_name: Option<String>,
    #[serde(rename = "NT")]
    pub nt: PresentedMetrics,
    #[serde(rename = "NR")]
    pub nr: PresentedMetrics,
    /// Whether the row passes the request's threshold filters.
    pub filtered: bool,
}

impl TaxonRow {
    pub fn metrics(&self, count_type: CountType) -> Option<&PresentedMetrics> {
        match count_type {
            CountType::Nt => Some(&self.nt),
            CountType::Nr => Some(&self.nr),
            CountType::MergedNtNr => None,
        }
    }

    pub fn max_zscore(&self) -> Option<f64> {
        self.nt.maxzscore
    }
}

/// Output unit: one per requested sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSampleResult {
    pub sample_id: SampleId,
    pub pipeline_run_id: Option<RunId>,
    pub name: String,
    pub metadata: Map<String, Value>,
    pub host_genome_name: Option<String>,
    pub pipeline_version: Option<String>,
    pub ercc_count: u64,
    pub taxons: Vec<TaxonRow>,
}
