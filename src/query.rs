//src/query.rs

use serde_json::{json, Map, Value};

/// Bound operator of a range clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Gte,
    Lte,
}

impl RangeOp {
    fn wire_name(&self) -> &'static str {
        match self {
            RangeOp::Gte => "gte",
            RangeOp::Lte => "lte",
        }
    }
}

/// A boolean predicate over indexed records.
///
/// Clauses are built with the constructors below, composed into AND-lists, and only
/// turned into the store's JSON shape by [`QueryClause::to_wire`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryClause {
    /// `field == value`
    Term { field: String, value: Value },
    /// `field IN values`
    Terms { field: String, values: Vec<Value> },
    /// Every bound must hold.
    Range {
        field: String,
        bounds: Vec<(RangeOp, Value)>,
    },
    /// The inner query must match one element of the nested array at `path`.
    Nested { path: String, query: Box<QueryClause> },
    Bool {
        filter: Vec<QueryClause>,
        must_not: Vec<QueryClause>,
    },
}

impl QueryClause {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryClause::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn terms<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        QueryClause::Terms {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn range(field: impl Into<String>, op: RangeOp, value: impl Into<Value>) -> Self {
        QueryClause::Range {
            field: field.into(),
            bounds: vec![(op, value.into())],
        }
    }

    pub fn nested(path: impl Into<String>, query: QueryClause) -> Self {
        QueryClause::Nested {
            path: path.into(),
            query: Box::new(query),
        }
    }

    pub fn and(filter: Vec<QueryClause>) -> Self {
        QueryClause::Bool {
            filter,
            must_not: Vec::new(),
        }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            QueryClause::Term { field, value } => json!({ "term": { field: value } }),
            QueryClause::Terms { field, values } => json!({ "terms": { field: values } }),
            QueryClause::Range { field, bounds } => {
                let mut ops = Map::new();
                for (op, value) in bounds {
                    ops.insert(op.wire_name().to_string(), value.clone());
                }
                json!({ "range": { field: ops } })
            }
            QueryClause::Nested { path, query } => {
                json!({ "nested": { "path": path, "query": query.to_wire() } })
            }
            QueryClause::Bool { filter, must_not } => {
                json!({ "bool": bool_body(filter, must_not) })
            }
        }
    }
}

fn bool_body(filter: &[QueryClause], must_not: &[QueryClause]) -> Value {
    let mut body = Map::new();
    body.insert(
        "filter".to_string(),
        Value::Array(filter.iter().map(QueryClause::to_wire).collect()),
    );
    if !must_not.is_empty() {
        body.insert(
            "must_not".to_string(),
            Value::Array(must_not.iter().map(QueryClause::to_wire).collect()),
        );
    }
    Value::Object(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn wire_name(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// One sort key. `nested` restricts a sort on a nested field to the elements matching the clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
    pub nested: Option<(String, QueryClause)>,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
            nested: None,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
            nested: None,
        }
    }

    pub fn nested_in(mut self, path: impl Into<String>, filter: QueryClause) -> Self {
        self.nested = Some((path.into(), filter));
        self
    }

    pub fn to_wire(&self) -> Value {
        let mut spec = Map::new();
        spec.insert("order".into(), Value::from(self.order.wire_name()));
        if let Some((path, filter)) = &self.nested {
            spec.insert(
                "nested".into(),
                json!({ "path": path, "filter": filter.to_wire() }),
            );
        }
        json!({ self.field.clone(): spec })
    }
}

/// Which `_source` fields come back with each hit.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceFilter {
    All,
    None,
    Fields(Vec<String>),
}

impl SourceFilter {
    fn to_wire(&self) -> Value {
        match self {
            SourceFilter::All => Value::Bool(true),
            SourceFilter::None => Value::Bool(false),
            SourceFilter::Fields(fields) => json!(fields),
        }
    }
}

/// Per-bucket top hits inside a terms aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct TopHitsAggregation {
    pub name: String,
    pub size: usize,
    pub sort: Vec<SortField>,
    pub source: SourceFilter,
}

/// `terms` bucket aggregation, optionally with a `top_hits` sub-aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct TermsAggregation {
    pub name: String,
    pub field: String,
    pub size: usize,
    pub top_hits: Option<TopHitsAggregation>,
}

impl TermsAggregation {
    fn to_wire(&self) -> Value {
        let mut agg = Map::new();
        agg.insert(
            "terms".into(),
            json!({ "field": self.field, "size": self.size }),
        );
        if let Some(top) = &self.top_hits {
            let sort: Vec<Value> = top.sort.iter().map(SortField::to_wire).collect();
            agg.insert(
                "aggs".into(),
                json!({
                    top.name.clone(): {
                        "top_hits": {
                            "size": top.size,
                            "sort": sort,
                            "_source": top.source.to_wire(),
                        }
                    }
                }),
            );
        }
        json!({ self.name.clone(): agg })
    }
}

/// A full search request. Rendered to the wire by [`SearchRequest::to_wire`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub source: SourceFilter,
    pub size: Option<usize>,
    pub filter: Vec<QueryClause>,
    pub must_not: Vec<QueryClause>,
    pub aggregation: Option<TermsAggregation>,
    pub sort: Vec<SortField>,
    pub search_after: Option<Vec<Value>>,
}

impl SearchRequest {
    pub fn new(filter: Vec<QueryClause>) -> Self {
        Self {
            source: SourceFilter::All,
            size: None,
            filter,
            must_not: Vec::new(),
            aggregation: None,
            sort: Vec::new(),
            search_after: None,
        }
    }

    pub fn source(mut self, source: SourceFilter) -> Self {
        self.source = source;
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn must_not(mut self, clauses: Vec<QueryClause>) -> Self {
        self.must_not = clauses;
        self
    }

    pub fn aggregation(mut self, agg: TermsAggregation) -> Self {
        self.aggregation = Some(agg);
        self
    }

    pub fn sort(mut self, sort: Vec<SortField>) -> Self {
        self.sort = sort;
        self
    }

    pub fn to_wire(&self) -> Value {
        let mut body = Map::new();
        body.insert("_source".into(), self.source.to_wire());
        if let Some(size) = self.size {
            body.insert("size".into(), Value::from(size));
        }
        body.insert(
            "query".into(),
            json!({ "bool": bool_body(&self.filter, &self.must_not) }),
        );
        if let Some(agg) = &self.aggregation {
            body.insert("aggs".into(), agg.to_wire());
        }
        if !self.sort.is_empty() {
            body.insert(
                "sort".into(),
                Value::Array(self.sort.iter().map(SortField::to_wire).collect()),
            );
        }
        if let Some(cursor) = &self.search_after {
            body.insert("search_after".into(), Value::Array(cursor.clone()));
        }
        Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_range_renders_store_shape() {
        let clause = QueryClause::nested(
            "metric_list",
            QueryClause::and(vec![
                QueryClause::term("metric_list.count_type", "NT"),
                QueryClause::range("metric_list.counts", RangeOp::Gte, 5.0),
            ]),
        );
        assert_eq!(
            clause.to_wire(),
            json!({
                "nested": {
                    "path": "metric_list",
                    "query": {"bool": {"filter": [
                        {"term": {"metric_list.count_type": "NT"}},
                        {"range": {"metric_list.counts": {"gte": 5.0}}}
                    ]}}
                }
            })
        );
    }

    #[test]
    fn request_omits_empty_sections() {
        let body = SearchRequest::new(vec![QueryClause::terms("tax_id", [1, 2])]).to_wire();
        assert_eq!(body["_source"], json!(true));
        assert!(body.get("sort").is_none());
        assert!(body.get("aggs").is_none());
        assert!(body["query"]["bool"].get("must_not").is_none());
        assert_eq!(body["query"]["bool"]["filter"][0], json!({"terms": {"tax_id": [1, 2]}}));
    }

    #[test]
    fn top_hits_aggregation_renders_nested_sort() {
        let agg = TermsAggregation {
            name: "pipeline_runs".into(),
            field: "pipeline_run_id".into(),
            size: 3,
            top_hits: Some(TopHitsAggregation {
                name: "top_taxa".into(),
                size: 10,
                sort: vec![SortField::desc("metric_list.rpm")
                    .nested_in("metric_list", QueryClause::term("metric_list.count_type", "NT"))],
                source: SourceFilter::Fields(vec!["tax_id".into()]),
            }),
        };
        let body = SearchRequest::new(vec![])
            .source(SourceFilter::None)
            .aggregation(agg)
            .to_wire();
        let top = &body["aggs"]["pipeline_runs"]["aggs"]["top_taxa"]["top_hits"];
        assert_eq!(body["aggs"]["pipeline_runs"]["terms"]["size"], json!(3));
        assert_eq!(top["size"], json!(10));
        assert_eq!(top["sort"][0]["metric_list.rpm"]["order"], json!("desc"));
        assert_eq!(
            top["sort"][0]["metric_list.rpm"]["nested"]["filter"],
            json!({"term": {"metric_list.count_type": "NT"}})
        );
        assert_eq!(top["_source"], json!(["tax_id"]));
    }
}
