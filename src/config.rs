//src/config.rs

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{HeatmapError, Result};

/// How the indexing/eviction functions are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// A locally running function emulator reached over plain HTTP.
    Local,
    /// A managed function-invocation gateway.
    Managed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    pub es_address: String,
    pub timeout_secs: u64,
    /// Index holding one document per (run, taxon, background).
    pub taxon_index: String,
    /// Index holding one document per (run, background) with `is_complete` and `last_read_at`.
    pub run_status_index: String,
    /// Hard cap the store puts on a single response.
    pub max_result_window: usize,
    pub page_size: usize,

    pub deployment_mode: DeploymentMode,
    pub function_endpoint: String,
    pub function_token: Option<String>,
    pub indexing_function: String,
    pub eviction_function: String,
    pub retry_attempts: u32,
    pub retry_backoff_secs: u64,

    pub default_background_id: Option<u64>,
    pub default_taxa_per_sample: usize,
    pub min_reads: f64,
    pub default_sort_by: String,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            es_address: "http://localhost:9200".to_string(),
            timeout_secs: 200,
            taxon_index: "scored_taxon_counts".to_string(),
            run_status_index: "pipeline_runs".to_string(),
            max_result_window: 10_000,
            page_size: 10_000,

            deployment_mode: DeploymentMode::Local,
            function_endpoint: "http://localhost:9000".to_string(),
            function_token: None,
            indexing_function: "taxon-indexing".to_string(),
            eviction_function: "taxon-eviction".to_string(),
            retry_attempts: 2,
            retry_backoff_secs: 3,

            default_background_id: None,
            default_taxa_per_sample: 10,
            min_reads: 5.0,
            default_sort_by: "highest_nt_rpm".to_string(),
        }
    }
}

impl HeatmapConfig {
    /// Reads a TOML file; missing keys keep their defaults.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: HeatmapConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the optional file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides. The lookup is injected so tests don't touch the process env.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("HEATMAP_ES_ADDRESS") {
            self.es_address = addr;
        }
        if let Some(secs) = lookup("HEATMAP_ES_TIMEOUT_SECS") {
            self.timeout_secs = secs.trim().parse().map_err(|_| {
                HeatmapError::Config(format!("HEATMAP_ES_TIMEOUT_SECS is not an integer: {secs}"))
            })?;
        }
        if let Some(mode) = lookup("HEATMAP_DEPLOYMENT_MODE") {
            self.deployment_mode = match mode.trim().to_ascii_lowercase().as_str() {
                "local" => DeploymentMode::Local,
                "managed" => DeploymentMode::Managed,
                other => {
                    return Err(HeatmapError::Config(format!(
                        "HEATMAP_DEPLOYMENT_MODE must be 'local' or 'managed', got '{other}'"
                    )))
                }
            };
        }
        if let Some(endpoint) = lookup("HEATMAP_FUNCTION_ENDPOINT") {
            self.function_endpoint = endpoint;
        }
        if let Some(token) = lookup("HEATMAP_FUNCTION_TOKEN") {
            self.function_token = Some(token);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_result_window == 0 {
            return Err(HeatmapError::Config("max_result_window must be positive".into()));
        }
        if self.page_size == 0 || self.page_size > self.max_result_window {
            return Err(HeatmapError::Config(format!(
                "page_size must be between 1 and {}",
                self.max_result_window
            )));
        }
        if self.retry_attempts == 0 {
            return Err(HeatmapError::Config("retry_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}
