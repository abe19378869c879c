//! Tag/attribute query language: parsing, evaluation, stored filter
//! management and the optional result cache.

mod ast;
mod cache;
mod coerce;
mod eval;
mod parser;

use std::time::Duration;

use thiserror::Error;

use crate::resolver::{ResolveError, normalize_filter_path};
use crate::store::{FilterRecord, NewFilter, StoreError};

pub use ast::{CompareOp, Expr, Predicate, TimeSpec};
pub use cache::FilterCache;
pub use coerce::{compare_values, parse_size, parse_time};
pub use eval::{FilterEngine, backends_of};
pub use parser::parse;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid query at position {position}: {message}")]
    Validation { position: usize, message: String },
    #[error(transparent)]
    Path(#[from] ResolveError),
    #[error("filter '{0}' not found")]
    NotFound(String),
    #[error("filter evaluation cancelled")]
    Cancelled,
    #[error("filter evaluation timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Definition of a stored filter as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub virtual_path: String,
    pub name: Option<String>,
    pub query: String,
    pub description: Option<String>,
}

impl FilterEngine {
    /// Validates the path and the query before persisting.
    pub async fn create_filter(&self, spec: FilterSpec) -> Result<FilterRecord, FilterError> {
        let virtual_path = normalize_filter_path(&spec.virtual_path)?;
        parse(&spec.query)?;
        let name = spec
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| virtual_path.clone());
        let record = self
            .store
            .create_filter(&NewFilter {
                virtual_path,
                name,
                query: spec.query,
                description: spec.description,
            })
            .await?;
        tracing::info!(filter = %record.virtual_path, query = %record.query, "filter created");
        Ok(record)
    }

    pub async fn get_filter(&self, virtual_path: &str) -> Result<FilterRecord, FilterError> {
        let virtual_path = normalize_filter_path(virtual_path)?;
        self.store
            .get_filter(&virtual_path)
            .await?
            .ok_or(FilterError::NotFound(virtual_path))
    }

    pub async fn list_filters(&self) -> Result<Vec<FilterRecord>, FilterError> {
        Ok(self.store.list_filters().await?)
    }

    /// Replaces path and query of an existing filter; an absent name or
    /// description keeps the stored one.
    pub async fn update_filter(
        &self,
        virtual_path: &str,
        spec: FilterSpec,
    ) -> Result<FilterRecord, FilterError> {
        let mut record = self.get_filter(virtual_path).await?;
        parse(&spec.query)?;
        record.virtual_path = normalize_filter_path(&spec.virtual_path)?;
        record.query = spec.query;
        if let Some(name) = spec.name.filter(|name| !name.trim().is_empty()) {
            record.name = name;
        }
        if spec.description.is_some() {
            record.description = spec.description;
        }
        let updated = self
            .store
            .update_filter(&record)
            .await?
            .ok_or_else(|| FilterError::NotFound(virtual_path.to_string()))?;
        if let Some(cache) = &self.cache {
            cache.invalidate_filter(updated.id);
        }
        tracing::info!(filter = %updated.virtual_path, "filter updated");
        Ok(updated)
    }

    pub async fn delete_filter(&self, virtual_path: &str) -> Result<(), FilterError> {
        let record = self.get_filter(virtual_path).await?;
        self.store.delete_filter(record.id).await?;
        if let Some(cache) = &self.cache {
            cache.invalidate_filter(record.id);
        }
        tracing::info!(filter = %record.virtual_path, "filter deleted");
        Ok(())
    }
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
