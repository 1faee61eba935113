//src/filters.rs

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::HeatmapConfig;
use crate::error::{HeatmapError, Result};
use crate::pathogens::PathogenListProvider;
use crate::query::{QueryClause, RangeOp};
use crate::types::{BackgroundId, CountType, TaxId, TaxLevel, TaxonRow};

/// Presentation alias -> internal metric field. Inverted by [`external_alias`].
pub const METRIC_NAME_TABLE: [(&str, &str); 6] = [
    ("r", "counts"),
    ("zscore", "zscore"),
    ("rpm", "rpm"),
    ("percentidentity", "percent_identity"),
    ("alignmentlength", "alignment_length"),
    ("logevalue", "e_value"),
];

/// Superkingdom taxon ids for the user-facing category names.
pub const CATEGORIES_TAXID_BY_NAME: [(&str, TaxId); 6] = [
    ("Bacteria", 2),
    ("Archaea", 2157),
    ("Eukaryota", 2759),
    ("Viruses", 10239),
    ("Viroids", 12884),
    ("Uncategorized", 0),
];

pub const KNOWN_PATHOGEN_TAG: &str = "known_pathogen";
pub const METRIC_LIST_PATH: &str = "metric_list";

pub fn internal_metric_name(alias: &str) -> Option<&'static str> {
    METRIC_NAME_TABLE
        .iter()
        .find(|(a, _)| *a == alias)
        .map(|(_, internal)| *internal)
}

pub fn external_alias(internal: &str) -> Option<&'static str> {
    METRIC_NAME_TABLE
        .iter()
        .find(|(_, i)| *i == internal)
        .map(|(alias, _)| *alias)
}

pub fn category_tax_id(name: &str) -> Option<TaxId> {
    CATEGORIES_TAXID_BY_NAME
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, id)| *id)
}

/// Threshold comparison; anything else is a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    AtLeast,
    AtMost,
}

impl Operator {
    pub fn parse(metric: &str, operator: &str) -> Result<Self> {
        match operator {
            ">=" => Ok(Operator::AtLeast),
            "<=" => Ok(Operator::AtMost),
            other => Err(HeatmapError::UnknownOperator {
                metric: metric.to_string(),
                operator: other.to_string(),
            }),
        }
    }

    fn range_op(&self) -> RangeOp {
        match self {
            Operator::AtLeast => RangeOp::Gte,
            Operator::AtMost => RangeOp::Lte,
        }
    }
}

/// Threshold filter as it arrives from the request: `{"metric": "NT_r", "value": "5", "operator": ">="}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawThresholdFilter {
    pub metric: String,
    #[serde(default)]
    pub value: Value,
    pub operator: String,
}

impl RawThresholdFilter {
    pub fn new(metric: &str, operator: &str, value: impl Into<Value>) -> Self {
        Self {
            metric: metric.to_string(),
            value: value.into(),
            operator: operator.to_string(),
        }
    }
}

/// A validated threshold filter.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdFilter {
    pub count_type: CountType,
    /// Presentation alias, e.g. `r`.
    pub metric: &'static str,
    /// Index field, e.g. `counts`.
    pub field: &'static str,
    pub operator: Operator,
    pub value: f64,
}

impl ThresholdFilter {
    /// Validates one raw filter.
    ///
    /// An unknown operator is an error. An unparseable value, count type or metric
    /// name drops the filter with a warning (`Ok(None)`).
    pub fn parse(raw: &RawThresholdFilter) -> Result<Option<Self>> {
        let operator = Operator::parse(&raw.metric, &raw.operator)?;

        let Some(value) = numeric_value(&raw.value) else {
            log::warn!(
                "Bad threshold filter value {} for {}; dropping filter",
                raw.value,
                raw.metric
            );
            return Ok(None);
        };

        let Some((count_type, metric_name)) = split_metric(&raw.metric) else {
            log::warn!("Threshold filter metric '{}' has no count type; dropping filter", raw.metric);
            return Ok(None);
        };
        let count_type = match count_type.parse::<CountType>() {
            Ok(ct) => ct,
            Err(_) => {
                log::warn!("Unknown count type in threshold filter '{}'; dropping filter", raw.metric);
                return Ok(None);
            }
        };
        let metric_name = metric_name.to_ascii_lowercase();
        let Some((alias, field)) = METRIC_NAME_TABLE
            .iter()
            .find(|(a, _)| *a == metric_name)
            .copied()
        else {
            log::warn!("Unknown metric in threshold filter '{}'; dropping filter", raw.metric);
            return Ok(None);
        };

        Ok(Some(ThresholdFilter {
            count_type,
            metric: alias,
            field,
            operator,
            value,
        }))
    }

    /// Evaluates the filter against an already normalized row. An absent metric fails.
    pub fn matches(&self, row: &TaxonRow) -> bool {
        let Some(actual) = row.metrics(self.count_type).and_then(|m| m.get(self.metric)) else {
            return false;
        };
        match self.operator {
            Operator::AtLeast => actual >= self.value,
            Operator::AtMost => actual <= self.value,
        }
    }
}

/// Splits `NT_r` or `NT.r` on the first separator.
fn split_metric(metric: &str) -> Option<(&str, &str)> {
    let idx = metric.find(['_', '.'])?;
    Some((&metric[..idx], &metric[idx + 1..]))
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

pub fn parse_threshold_filters(raw: &[RawThresholdFilter]) -> Result<Vec<ThresholdFilter>> {
    let mut parsed = Vec::with_capacity(raw.len());
    for filter in raw {
        if let Some(f) = ThresholdFilter::parse(filter)? {
            parsed.push(f);
        }
    }
    Ok(parsed)
}

/// True when the row passes every filter.
pub fn apply_threshold_filters(row: &TaxonRow, filters: &[ThresholdFilter]) -> bool {
    filters.iter().all(|f| f.matches(row))
}

/// Superkingdom restriction plus the phage equality clause.
pub fn build_category_clause(categories: &[String], include_phage: bool) -> Vec<QueryClause> {
    let mut clauses = Vec::new();

    if !categories.is_empty() {
        let ids: Vec<TaxId> = categories
            .iter()
            .filter_map(|name| {
                let id = category_tax_id(name);
                if id.is_none() {
                    log::warn!("Ignoring unknown category '{name}'");
                }
                id
            })
            .collect();
        clauses.push(QueryClause::terms("superkingdom_taxid", ids));
    } else if include_phage {
        // Phage alone still needs its parent category.
        if let Some(viruses) = category_tax_id("Viruses") {
            clauses.push(QueryClause::term("superkingdom_taxid", viruses));
        }
    }

    if !include_phage && !categories.is_empty() {
        clauses.push(QueryClause::term("is_phage", 0));
    } else if include_phage && categories.is_empty() {
        clauses.push(QueryClause::term("is_phage", 1));
    }

    clauses
}

/// Excludes reads not assigned at species or genus level.
pub fn build_read_specificity_clause(enabled: bool) -> Vec<QueryClause> {
    if !enabled {
        return Vec::new();
    }
    vec![
        QueryClause::range("tax_id", RangeOp::Gte, 0),
        QueryClause::range("genus_taxid", RangeOp::Gte, 0),
    ]
}

/// One nested clause per count type holding all of that count type's ranges.
pub fn build_threshold_clauses(raw: &[RawThresholdFilter]) -> Result<Vec<QueryClause>> {
    let parsed = parse_threshold_filters(raw)?;

    let mut by_count_type: BTreeMap<CountType, Vec<QueryClause>> = BTreeMap::new();
    for filter in &parsed {
        by_count_type
            .entry(filter.count_type)
            .or_default()
            .push(QueryClause::range(
                format!("{METRIC_LIST_PATH}.{}", filter.field),
                filter.operator.range_op(),
                filter.value,
            ));
    }

    Ok(by_count_type
        .into_iter()
        .map(|(count_type, ranges)| {
            let mut inner = Vec::with_capacity(ranges.len() + 1);
            inner.push(QueryClause::term(
                format!("{METRIC_LIST_PATH}.count_type"),
                count_type.as_str(),
            ));
            inner.extend(ranges);
            QueryClause::nested(METRIC_LIST_PATH, QueryClause::and(inner))
        })
        .collect())
}

pub fn build_taxon_tag_clause(
    tags: &[String],
    pathogens: &dyn PathogenListProvider,
) -> Result<Vec<QueryClause>> {
    if !tags.iter().any(|t| t == KNOWN_PATHOGEN_TAG) {
        return Ok(Vec::new());
    }
    let ids = pathogens.pathogen_tax_ids()?;
    Ok(vec![QueryClause::terms("tax_id", ids)])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Highest,
    Lowest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub direction: SortDirection,
    pub count_type: CountType,
    /// Presentation alias of the sort metric.
    pub metric: &'static str,
}

impl SortSpec {
    pub fn field(&self) -> String {
        let internal = internal_metric_name(self.metric).unwrap_or(self.metric);
        format!("{METRIC_LIST_PATH}.{internal}")
    }
}

/// Decodes `highest_nt_rpm` style sort keys.
pub fn decode_sort_by(sort_by: &str) -> Result<SortSpec> {
    let invalid = || HeatmapError::InvalidSortBy(sort_by.to_string());
    let mut parts = sort_by.splitn(3, '_');
    let (Some(direction), Some(count_type), Some(metric)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let direction = match direction {
        "highest" => SortDirection::Highest,
        "lowest" => SortDirection::Lowest,
        _ => return Err(invalid()),
    };
    let count_type = match count_type.parse::<CountType>() {
        Ok(ct @ (CountType::Nt | CountType::Nr)) => ct,
        _ => return Err(invalid()),
    };
    let metric = METRIC_NAME_TABLE
        .iter()
        .map(|(alias, _)| *alias)
        .find(|alias| *alias == metric)
        .ok_or_else(invalid)?;
    Ok(SortSpec {
        direction,
        count_type,
        metric,
    })
}

/// Request-scoped filter criteria.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub background_id: BackgroundId,
    pub taxon_level: TaxLevel,
    pub categories: Vec<String>,
    pub include_phage: bool,
    pub read_specificity: bool,
    pub threshold_filters: Vec<RawThresholdFilter>,
    pub taxon_tags: Vec<String>,
    pub sort: SortSpec,
    pub taxa_per_sample: usize,
    /// Explicit taxa for the taxa-details mode.
    pub taxon_ids: Vec<TaxId>,
    pub removed_taxon_ids: Vec<TaxId>,
}

impl FilterSpec {
    pub fn new(background_id: BackgroundId, taxon_level: TaxLevel, sort: SortSpec) -> Self {
        Self {
            background_id,
            taxon_level,
            categories: Vec::new(),
            include_phage: false,
            read_specificity: false,
            threshold_filters: Vec::new(),
            taxon_tags: Vec::new(),
            sort,
            taxa_per_sample: 10,
            taxon_ids: Vec::new(),
            removed_taxon_ids: Vec::new(),
        }
    }

    /// Decodes request parameters. Appends the mandatory minimum-reads threshold
    /// for the sort key's count type.
    pub fn from_params(params: &HeatmapParams, config: &HeatmapConfig) -> Result<Self> {
        let background_id = params
            .background_id
            .as_ref()
            .and_then(value_as_i64)
            .filter(|id| *id > 0)
            .map(|id| id as BackgroundId)
            .or(config.default_background_id)
            .ok_or_else(|| HeatmapError::Config("no background given and no default configured".into()))?;

        let sort = decode_sort_by(params.sort_by.as_deref().unwrap_or(&config.default_sort_by))?;

        let taxon_level = match params.species.as_ref().and_then(value_as_i64) {
            Some(1) => TaxLevel::Species,
            _ => TaxLevel::Genus,
        };

        let mut threshold_filters = decode_threshold_filters(params.threshold_filters.as_ref())?;
        let min_reads = params
            .min_reads
            .as_ref()
            .and_then(numeric_value)
            .unwrap_or(config.min_reads);
        threshold_filters.push(RawThresholdFilter::new(
            &format!("{}_r", sort.count_type),
            ">=",
            min_reads,
        ));

        let include_phage = match params.subcategories.as_ref() {
            Some(sub) => includes_phage(sub)?,
            None => false,
        };

        let taxa_per_sample = params
            .taxons_per_sample
            .as_ref()
            .and_then(value_as_i64)
            .map(|n| n.max(0) as usize)
            .unwrap_or(config.default_taxa_per_sample);

        let removed: AHashSet<TaxId> = params
            .removed_taxon_ids
            .iter()
            .filter_map(value_as_i64)
            .collect();
        let mut removed_taxon_ids: Vec<TaxId> = removed.into_iter().collect();
        removed_taxon_ids.sort_unstable();

        let taxon_ids = params
            .taxon_ids
            .iter()
            .filter_map(value_as_i64)
            .filter(|id| removed_taxon_ids.binary_search(id).is_err())
            .collect();

        Ok(FilterSpec {
            background_id,
            taxon_level,
            categories: params.categories.clone().unwrap_or_default(),
            include_phage,
            read_specificity: params
                .read_specificity
                .as_ref()
                .and_then(value_as_i64)
                .is_some_and(|v| v == 1),
            threshold_filters,
            taxon_tags: params.taxon_tags.clone(),
            sort,
            taxa_per_sample,
            taxon_ids,
            removed_taxon_ids,
        })
    }
}

/// Every user-facing clause, ANDed by the caller.
pub fn build_filter_clauses(
    spec: &FilterSpec,
    pathogens: &dyn PathogenListProvider,
) -> Result<Vec<QueryClause>> {
    let mut clauses = build_threshold_clauses(&spec.threshold_filters)?;
    clauses.extend(build_category_clause(&spec.categories, spec.include_phage));
    clauses.extend(build_read_specificity_clause(spec.read_specificity));
    clauses.extend(build_taxon_tag_clause(&spec.taxon_tags, pathogens)?);
    Ok(clauses)
}

/// Heatmap request parameters in their wire (camelCase) form.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeatmapParams {
    pub background_id: Option<Value>,
    pub min_reads: Option<Value>,
    pub removed_taxon_ids: Vec<Value>,
    pub taxon_ids: Vec<Value>,
    /// A JSON string, an array of JSON strings, or an array of objects.
    pub threshold_filters: Option<Value>,
    pub categories: Option<Vec<String>>,
    /// `{"Viruses": ["Phage"]}`, possibly JSON-encoded as a string.
    pub subcategories: Option<Value>,
    pub species: Option<Value>,
    pub read_specificity: Option<Value>,
    pub sort_by: Option<String>,
    pub taxons_per_sample: Option<Value>,
    pub taxon_tags: Vec<String>,
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn decode_threshold_filters(value: Option<&Value>) -> Result<Vec<RawThresholdFilter>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(serde_json::from_str(s)?),
        Value::Array(items) => items
            .iter()
            .map(|item| -> Result<RawThresholdFilter> {
                match item {
                    Value::String(s) => Ok(serde_json::from_str(s)?),
                    other => Ok(serde_json::from_value(other.clone())?),
                }
            })
            .collect(),
        other => Ok(vec![serde_json::from_value(other.clone())?]),
    }
}

fn includes_phage(subcategories: &Value) -> Result<bool> {
    let parsed;
    let sub = match subcategories {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s)?;
            &parsed
        }
        other => other,
    };
    Ok(sub
        .get("Viruses")
        .and_then(Value::as_array)
        .is_some_and(|v| v.iter().any(|s| s.as_str() == Some("Phage"))))
}
