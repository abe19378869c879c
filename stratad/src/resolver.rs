//! Classification of virtual paths into backend paths and filter paths.

use strata_integrations::ids::FILTER_NAMESPACE;
use thiserror::Error;

use crate::store::{BackendRecord, FilterRecord, MetadataStore, StoreError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid path segment '{segment}': {reason}")]
    InvalidPath {
        segment: String,
        reason: &'static str,
    },
    #[error("backend '{0}' not found")]
    BackendNotFound(String),
    #[error("filter '{0}' not found")]
    FilterNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Empty path: every backend.
    Root,
    /// The bare filter namespace: every filter.
    FilterRoot,
    Backend { backend: BackendRecord, path: String },
    Filter(FilterRecord),
}

/// Path split into segments with empty ones dropped.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn invalid(segment: &str, reason: &'static str) -> ResolveError {
    ResolveError::InvalidPath {
        segment: segment.to_string(),
        reason,
    }
}

/// Checks the backend identifier charset `[A-Za-z0-9_-]` and the reserved
/// namespace token.
pub fn validate_backend_id(id: &str) -> Result<(), ResolveError> {
    if id.is_empty() {
        return Err(invalid(id, "identifier is empty"));
    }
    if id.starts_with('.') {
        return Err(invalid(id, "identifier must not start with '.'"));
    }
    if id.contains('/') {
        return Err(invalid(id, "identifier must not contain '/'"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(id, "identifier may only contain [A-Za-z0-9_-]"));
    }
    if id == FILTER_NAMESPACE {
        return Err(invalid(id, "identifier is reserved for filters"));
    }
    Ok(())
}

/// Canonical stored form of a filter virtual path: segments joined by `/`,
/// without the namespace token.
pub fn normalize_filter_path(raw: &str) -> Result<String, ResolveError> {
    let mut parts = segments(raw);
    if parts.first() == Some(&FILTER_NAMESPACE) {
        parts.remove(0);
    }
    if parts.is_empty() {
        return Err(invalid(raw, "filter path is empty"));
    }
    for part in &parts {
        if *part == "." || *part == ".." {
            return Err(invalid(part, "relative segments are not allowed"));
        }
    }
    Ok(parts.join("/"))
}

/// Resolves virtual paths against the current store state. Nothing is cached.
#[derive(Clone, Copy)]
pub struct PathResolver<'a> {
    store: &'a MetadataStore,
}

impl<'a> PathResolver<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, path: &str) -> Result<Resolved, ResolveError> {
        let parts = segments(path);
        let Some((first, rest)) = parts.split_first() else {
            return Ok(Resolved::Root);
        };

        if *first == FILTER_NAMESPACE {
            if rest.is_empty() {
                return Ok(Resolved::FilterRoot);
            }
            let virtual_path = rest.join("/");
            return match self.store.get_filter(&virtual_path).await? {
                Some(filter) => Ok(Resolved::Filter(filter)),
                None => Err(ResolveError::FilterNotFound(virtual_path)),
            };
        }

        validate_backend_id(first)?;
        match self.store.get_backend(first).await? {
            Some(backend) => Ok(Resolved::Backend {
                backend,
                path: rest.join("/"),
            }),
            None => Err(ResolveError::BackendNotFound(first.to_string())),
        }
    }

    /// Resolves a path that must name a backend location.
    pub async fn resolve_backend_path(
        &self,
        path: &str,
    ) -> Result<(BackendRecord, String), ResolveError> {
        match self.resolve(path).await? {
            Resolved::Backend { backend, path } => Ok((backend, path)),
            Resolved::Root | Resolved::FilterRoot => {
                Err(invalid(path, "path does not name a backend"))
            }
            Resolved::Filter(filter) => Err(ResolveError::InvalidPath {
                segment: format!("{FILTER_NAMESPACE}/{}", filter.virtual_path),
                reason: "filter paths are read-only views",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewBackend, NewFilter};
    use strata_core::ConnectionInfo;

    async fn seeded_store() -> MetadataStore {
        let store = MetadataStore::in_memory().await.unwrap();
        store
            .create_backend(&NewBackend {
                id: "selfhosted".into(),
                name: "Self hosted".into(),
                connection: ConnectionInfo {
                    endpoint: "minio.lan:9000".into(),
                    region: None,
                    bucket: "files".into(),
                    use_ssl: false,
                },
                access_key_enc: "v1:a".into(),
                secret_key_enc: "v1:s".into(),
            })
            .await
            .unwrap();
        store
            .create_filter(&NewFilter {
                virtual_path: "pictures/red".into(),
                name: "Red pictures".into(),
                query: "tag:colour=red".into(),
                description: None,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn backend_paths_split_into_id_and_remainder() {
        let store = seeded_store().await;
        let resolver = PathResolver::new(&store);
        match resolver.resolve("selfhosted/photos/2024/a.jpg").await.unwrap() {
            Resolved::Backend { backend, path } => {
                assert_eq!(backend.id, "selfhosted");
                assert_eq!(path, "photos/2024/a.jpg");
            }
            other => panic!("unexpected {other:?}"),
        }
        match resolver.resolve("/selfhosted/").await.unwrap() {
            Resolved::Backend { path, .. } => assert_eq!(path, ""),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_paths_resolve_to_root() {
        let store = seeded_store().await;
        let resolver = PathResolver::new(&store);
        assert_eq!(resolver.resolve("").await.unwrap(), Resolved::Root);
        assert_eq!(resolver.resolve("///").await.unwrap(), Resolved::Root);
        assert_eq!(resolver.resolve("filters").await.unwrap(), Resolved::FilterRoot);
    }

    #[tokio::test]
    async fn filter_paths_match_the_whole_remainder() {
        let store = seeded_store().await;
        let resolver = PathResolver::new(&store);
        match resolver.resolve("filters/pictures/red").await.unwrap() {
            Resolved::Filter(filter) => assert_eq!(filter.query, "tag:colour=red"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            resolver.resolve("filters/pictures").await,
            Err(ResolveError::FilterNotFound(path)) if path == "pictures"
        ));
    }

    #[tokio::test]
    async fn unknown_and_malformed_first_segments_fail() {
        let store = seeded_store().await;
        let resolver = PathResolver::new(&store);
        assert!(matches!(
            resolver.resolve("nowhere/a").await,
            Err(ResolveError::BackendNotFound(id)) if id == "nowhere"
        ));
        assert!(matches!(
            resolver.resolve(".hidden/a").await,
            Err(ResolveError::InvalidPath { .. })
        ));
        assert!(matches!(
            resolver.resolve("bad id/a").await,
            Err(ResolveError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn filter_targets_are_not_backend_paths() {
        let store = seeded_store().await;
        let resolver = PathResolver::new(&store);
        assert!(matches!(
            resolver.resolve_backend_path("filters/pictures/red").await,
            Err(ResolveError::InvalidPath { .. })
        ));
        let (backend, path) = resolver
            .resolve_backend_path("selfhosted/docs")
            .await
            .unwrap();
        assert_eq!((backend.id.as_str(), path.as_str()), ("selfhosted", "docs"));
    }

    #[test]
    fn backend_ids_follow_the_charset() {
        for good in ["selfhosted", "b-2", "under_score", "X9"] {
            validate_backend_id(good).unwrap();
        }
        for bad in ["", ".dot", "a/b", "sp ace", "ünï", "filters"] {
            assert!(validate_backend_id(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn filter_paths_normalise_without_namespace() {
        assert_eq!(
            normalize_filter_path("filters/pictures/red").unwrap(),
            "pictures/red"
        );
        assert_eq!(
            normalize_filter_path("/pictures//red/").unwrap(),
            "pictures/red"
        );
        assert!(normalize_filter_path("filters").is_err());
        assert!(normalize_filter_path("a/../b").is_err());
    }
}
