//src/pathogens.rs

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::Result;
use crate::types::TaxId;

/// Source of the current global "known pathogen" taxon list.
pub trait PathogenListProvider: Send + Sync {
    fn pathogen_tax_ids(&self) -> Result<Vec<TaxId>>;
}

/// A fixed list, e.g. loaded once from a file at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticPathogenList {
    tax_ids: Vec<TaxId>,
}

impl StaticPathogenList {
    pub fn new(mut tax_ids: Vec<TaxId>) -> Self {
        tax_ids.sort_unstable();
        tax_ids.dedup();
        Self { tax_ids }
    }

    /// Parses one taxon id per line; blank lines and `#` comments are skipped.
    pub fn from_lines(text: &str) -> Self {
        let tax_ids = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| match l.parse::<TaxId>() {
                Ok(id) => Some(id),
                Err(_) => {
                    log::warn!("Skipping malformed pathogen list line: {l}");
                    None
                }
            })
            .collect();
        Self::new(tax_ids)
    }
}

impl PathogenListProvider for StaticPathogenList {
    fn pathogen_tax_ids(&self) -> Result<Vec<TaxId>> {
        Ok(self.tax_ids.clone())
    }
}

/// Wraps a slower provider and keeps the first successful answer until `invalidate`.
pub struct CachedPathogenList {
    inner: Arc<dyn PathogenListProvider>,
    cached: RwLock<Option<Vec<TaxId>>>,
}

impl CachedPathogenList {
    pub fn new(inner: Arc<dyn PathogenListProvider>) -> Self {
        Self {
            inner,
            cached: RwLock::new(None),
        }
    }

    /// Drop the cached list, e.g. after a new pathogen list version is published.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

impl PathogenListProvider for CachedPathogenList {
    fn pathogen_tax_ids(&self) -> Result<Vec<TaxId>> {
        if let Some(ids) = self.cached.read().as_ref() {
            return Ok(ids.clone());
        }
        let mut slot = self.cached.write();
        if let Some(ids) = slot.as_ref() {
            return Ok(ids.clone());
        }
        let ids = self.inner.pathogen_tax_ids()?;
        *slot = Some(ids.clone());
        Ok(ids)
    }
}
