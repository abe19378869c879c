use std::path::PathBuf;

use url::Url;

use super::EngineError;
use crate::resolver::{PathResolver, Resolved};
use crate::store::{FilterRecord, SyncConfigRecord, SyncDirection};

/// Remote side of a sync config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEndpoint {
    /// A backend and a key prefix without slashes at either end.
    Backend { backend_id: String, prefix: String },
    /// A filter view; relative paths are `<backend>/<path>`.
    Filter(FilterRecord),
}

/// Both endpoints of a config, classified and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub local_root: PathBuf,
    pub remote: RemoteEndpoint,
    pub local_is_source: bool,
}

/// Local endpoints are absolute paths or `file://` URLs.
pub fn parse_local_path(raw: &str) -> Option<PathBuf> {
    if raw.starts_with("file://") {
        return Url::parse(raw).ok()?.to_file_path().ok();
    }
    let path = PathBuf::from(raw);
    path.is_absolute().then_some(path)
}

impl SyncPlan {
    pub async fn build(
        resolver: &PathResolver<'_>,
        source: &str,
        destination: &str,
        direction: SyncDirection,
    ) -> Result<Self, EngineError> {
        let (local_root, remote_raw, local_is_source) =
            match (parse_local_path(source), parse_local_path(destination)) {
                (Some(root), None) => (root, destination, true),
                (None, Some(root)) => (root, source, false),
                (Some(_), Some(_)) => {
                    return Err(EngineError::InvalidConfig(
                        "both endpoints are local directories".into(),
                    ));
                }
                (None, None) => {
                    return Err(EngineError::InvalidConfig(
                        "one endpoint must be a local directory".into(),
                    ));
                }
            };

        let remote = match resolver.resolve(remote_raw).await? {
            Resolved::Backend { backend, path } => RemoteEndpoint::Backend {
                backend_id: backend.id,
                prefix: path,
            },
            Resolved::Filter(filter) => {
                if local_is_source {
                    return Err(EngineError::InvalidConfig(format!(
                        "filter '{}' can only be a sync source",
                        filter.virtual_path
                    )));
                }
                if direction != SyncDirection::DownloadOnly {
                    return Err(EngineError::InvalidConfig(format!(
                        "filter '{}' is read-only; use download-only",
                        filter.virtual_path
                    )));
                }
                RemoteEndpoint::Filter(filter)
            }
            Resolved::Root | Resolved::FilterRoot => {
                return Err(EngineError::InvalidConfig(format!(
                    "'{remote_raw}' does not name a backend path or a filter"
                )));
            }
        };

        Ok(Self {
            local_root,
            remote,
            local_is_source,
        })
    }

    pub async fn for_config(
        resolver: &PathResolver<'_>,
        config: &SyncConfigRecord,
    ) -> Result<Self, EngineError> {
        Self::build(
            resolver,
            &config.source_path,
            &config.dest_path,
            config.direction,
        )
        .await
    }
}

/// Object key for a relative path under `prefix`.
pub fn join_key(prefix: &str, rel_path: &str) -> String {
    if prefix.is_empty() {
        rel_path.to_string()
    } else {
        format!("{prefix}/{rel_path}")
    }
}
