//src/error.rs

use thiserror::Error;

use crate::types::{BackgroundId, RunId};

pub type Result<T> = std::result::Result<T, HeatmapError>;

/// One item the indexing job reported as failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub pipeline_run_id: Option<RunId>,
    pub background_id: Option<BackgroundId>,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum HeatmapError {
    #[error("unknown threshold operator '{operator}' for metric '{metric}' (expected >= or <=)")]
    UnknownOperator { metric: String, operator: String },
    #[error("unknown count type '{0}'")]
    UnknownCountType(String),
    #[error("invalid sort key '{0}' (expected <highest|lowest>_<nt|nr>_<metric>)")]
    InvalidSortBy(String),
    #[error("paginated query against '{0}' has no sort specification")]
    MissingSort(String),
    #[error("page from '{0}' ended on a hit without a sort cursor")]
    MissingCursor(String),
    #[error("too many pipeline runs given ({count}); select {max} or fewer")]
    TooManyRuns { count: usize, max: usize },
    #[error("search store error: {0}")]
    Store(String),
    #[error("malformed search store response: {0}")]
    MalformedResponse(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invocation of '{function}' failed: {message}")]
    Invocation { function: String, message: String },
    #[error("indexing job '{function}' failed for {} item(s): {}", failures.len(), describe_failures(failures))]
    BatchIndexingFailed {
        function: String,
        failures: Vec<ItemFailure>,
    },
}

fn describe_failures(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(|f| match (f.pipeline_run_id, f.background_id) {
            (Some(run), Some(bg)) => format!("run {run}/background {bg}: {}", f.message),
            (Some(run), None) => format!("run {run}: {}", f.message),
            _ => f.message.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<toml::de::Error> for HeatmapError {
    fn from(err: toml::de::Error) -> Self {
        HeatmapError::Config(err.to_string())
    }
}
