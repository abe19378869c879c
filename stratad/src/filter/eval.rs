use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::FilterError;
use super::ast::{Expr, Predicate};
use super::cache::FilterCache;
use super::coerce::compare_values;
use super::parser::parse;
use crate::store::{FileRecord, FilterRecord, MetadataStore, StoreError, now_unix};

const UNKNOWN_MIME: &str = "application/octet-stream";

/// Evaluates filter queries against the metadata store. Results are computed
/// fresh unless a cache is attached.
pub struct FilterEngine {
    pub(super) store: Arc<MetadataStore>,
    pub(super) cache: Option<Arc<FilterCache>>,
}

impl FilterEngine {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store, cache: None }
    }

    /// Attaches a result cache that the store invalidates on every file or tag
    /// write.
    pub fn with_cache(store: Arc<MetadataStore>) -> Self {
        let cache = Arc::new(FilterCache::default());
        store.subscribe(cache.clone());
        Self {
            store,
            cache: Some(cache),
        }
    }

    pub fn cache(&self) -> Option<&Arc<FilterCache>> {
        self.cache.as_ref()
    }

    pub async fn evaluate_query(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileRecord>, FilterError> {
        let expr = parse(query)?;
        self.evaluate(&expr, cancel).await
    }

    /// Evaluates a stored filter, serving and filling the cache when attached.
    /// Filters relative to the clock are never cached.
    pub async fn evaluate_filter(
        &self,
        filter: &FilterRecord,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileRecord>, FilterError> {
        let expr = parse(&filter.query)?;
        let cache = self.cache.as_ref().filter(|_| !expr.is_time_relative());
        let Some(cache) = cache else {
            return self.evaluate(&expr, cancel).await;
        };
        if let Some(files) = cache.get(filter.id) {
            tracing::debug!(filter = %filter.virtual_path, "filter cache hit");
            return Ok(files);
        }
        let generation = cache.generation();
        let files = self.evaluate(&expr, cancel).await?;
        cache.insert(
            filter.id,
            generation,
            expr.candidate_backends(),
            files.clone(),
        );
        Ok(files)
    }

    /// Like [`Self::evaluate_filter`], abandoning the evaluation after `timeout`.
    pub async fn evaluate_filter_with_timeout(
        &self,
        filter: &FilterRecord,
        timeout: Duration,
    ) -> Result<Vec<FileRecord>, FilterError> {
        let cancel = CancellationToken::new();
        match tokio::time::timeout(timeout, self.evaluate_filter(filter, &cancel)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(FilterError::TimedOut(timeout))
            }
        }
    }

    /// Evaluates bottom-up over sets of file ids: AND intersects, OR unites and
    /// NOT complements against every active file. Output is ordered by
    /// (backend, path).
    pub async fn evaluate(
        &self,
        expr: &Expr,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileRecord>, FilterError> {
        let now = now_unix();
        let files: Vec<FileRecord> = guarded(cancel, self.store.list_active_files())
            .await?
            .into_iter()
            .filter(|file| !file.is_dir)
            .collect();
        let universe: BTreeSet<i64> = files.iter().map(|file| file.id).collect();

        let mut sets = Vec::new();
        for atom in expr.atoms() {
            if cancel.is_cancelled() {
                return Err(FilterError::Cancelled);
            }
            sets.push(self.atom_set(atom, &files, &universe, now, cancel).await?);
        }

        let matched = combine(expr, &mut sets.into_iter(), &universe);
        let mut result: Vec<FileRecord> = files
            .into_iter()
            .filter(|file| matched.contains(&file.id))
            .collect();
        result.sort_by(|a, b| {
            (a.backend_id.as_bytes(), a.path.as_bytes())
                .cmp(&(b.backend_id.as_bytes(), b.path.as_bytes()))
        });
        Ok(result)
    }

    async fn atom_set(
        &self,
        atom: &Predicate,
        files: &[FileRecord],
        universe: &BTreeSet<i64>,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<i64>, FilterError> {
        let ids: BTreeSet<i64> = match atom {
            Predicate::Tag { key, op, value } => {
                if *op == super::ast::CompareOp::Eq {
                    guarded(cancel, self.store.file_ids_with_tag(key, value))
                        .await?
                        .into_iter()
                        .collect()
                } else {
                    guarded(cancel, self.store.tag_values_for_key(key))
                        .await?
                        .into_iter()
                        .filter(|(_, stored)| op.accepts(compare_values(stored, value)))
                        .map(|(id, _)| id)
                        .collect()
                }
            }
            Predicate::MimeType(glob) => {
                let matcher = glob.compile_matcher();
                matching(files, |file| {
                    let mime = mime_guess::from_path(&file.path)
                        .first_raw()
                        .unwrap_or(UNKNOWN_MIME);
                    matcher.is_match(mime)
                })
            }
            Predicate::Size { op, bytes } => matching(files, |file| op.accepts(file.size.cmp(bytes))),
            Predicate::Modified { op, at } => {
                let at = at.resolve(now);
                matching(files, |file| op.accepts(file.modified_at.cmp(&at)))
            }
            Predicate::Path(glob) => {
                let matcher = glob.compile_matcher();
                matching(files, |file| matcher.is_match(&file.path))
            }
            // an unknown backend simply matches nothing
            Predicate::Backend(id) => matching(files, |file| &file.backend_id == id),
        };
        Ok(ids.intersection(universe).copied().collect())
    }
}

fn matching(files: &[FileRecord], predicate: impl Fn(&FileRecord) -> bool) -> BTreeSet<i64> {
    files
        .iter()
        .filter(|file| predicate(file))
        .map(|file| file.id)
        .collect()
}

/// Folds per-atom sets in the same left-to-right order [`Expr::atoms`] yields.
fn combine(
    expr: &Expr,
    sets: &mut impl Iterator<Item = BTreeSet<i64>>,
    universe: &BTreeSet<i64>,
) -> BTreeSet<i64> {
    match expr {
        Expr::Atom(_) => sets.next().unwrap_or_default(),
        Expr::And(left, right) => {
            let left = combine(left, sets, universe);
            let right = combine(right, sets, universe);
            left.intersection(&right).copied().collect()
        }
        Expr::Or(left, right) => {
            let mut left = combine(left, sets, universe);
            left.extend(combine(right, sets, universe));
            left
        }
        Expr::Not(inner) => {
            let inner = combine(inner, sets, universe);
            universe.difference(&inner).copied().collect()
        }
    }
}

/// Runs a read-only store query unless the caller cancels first.
async fn guarded<T>(
    cancel: &CancellationToken,
    query: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, FilterError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FilterError::Cancelled),
        result = query => Ok(result?),
    }
}

/// Distinct backends of a result set, in order.
pub fn backends_of(files: &[FileRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    files
        .iter()
        .filter(|file| seen.insert(file.backend_id.clone()))
        .map(|file| file.backend_id.clone())
        .collect()
}
