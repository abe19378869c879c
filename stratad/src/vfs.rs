//! Virtual-filesystem and tag operations: listing, existence tests, touch,
//! removal and directory creation over backend paths, tag maintenance on
//! files, and reconciliation of a backend's physical objects with the catalog.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use strata_core::{ObjectInfo, ObjectStore, StorageError};
use strata_integrations::ids::FILTER_NAMESPACE;
use strata_integrations::{AutoTagReport, EntryKind, ScanReport, VfsEntry};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::filter::{FilterEngine, FilterError};
use crate::registry::{BackendRegistry, RegistryError};
use crate::resolver::{PathResolver, ResolveError, Resolved, segments};
use crate::store::{
    BackendRecord, ChangeKind, FileInput, FileRecord, MetadataStore, StoreError, TagRecord,
    now_unix,
};
use crate::sync::is_md5_hex;

const UNKNOWN_MIME: &str = "application/octet-stream";
const NO_LIMIT: i64 = i64::MAX;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("invalid path segment '{segment}': {reason}")]
    InvalidPath {
        segment: String,
        reason: &'static str,
    },
    #[error("{0}")]
    Validation(String),
    #[error("removing every object of backend '{0}' requires confirmation")]
    ConfirmationRequired(String),
    #[error("'{0}' is not empty; remove it recursively")]
    NotEmpty(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub recursive: bool,
    /// Required to wipe a whole backend.
    pub confirm: bool,
}

/// Operations behind the command surface's filesystem and tag verbs.
pub struct VfsService {
    store: Arc<MetadataStore>,
    registry: Arc<BackendRegistry>,
    filters: Arc<FilterEngine>,
    client_id: String,
}

impl VfsService {
    pub fn new(
        store: Arc<MetadataStore>,
        registry: Arc<BackendRegistry>,
        filters: Arc<FilterEngine>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            filters,
            client_id: client_id.into(),
        }
    }

    fn resolver(&self) -> PathResolver<'_> {
        PathResolver::new(&self.store)
    }

    /// Lists the entries under a virtual path. The root lists backends plus the
    /// filter namespace, a filter lists its current result set.
    pub async fn list(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<VfsEntry>, VfsError> {
        match self.resolver().resolve(path).await? {
            Resolved::Root => {
                let mut entries: Vec<VfsEntry> = self
                    .registry
                    .list()
                    .await?
                    .into_iter()
                    .map(|backend| VfsEntry {
                        name: backend.id.clone(),
                        path: backend.id,
                        kind: EntryKind::Backend,
                        size: Some(backend.total_bytes),
                        modified_at: Some(backend.updated_at),
                    })
                    .collect();
                entries.push(VfsEntry {
                    name: FILTER_NAMESPACE.to_string(),
                    path: FILTER_NAMESPACE.to_string(),
                    kind: EntryKind::Directory,
                    size: None,
                    modified_at: None,
                });
                Ok(entries)
            }
            Resolved::FilterRoot => Ok(self
                .filters
                .list_filters()
                .await?
                .into_iter()
                .map(|filter| VfsEntry {
                    path: format!("{FILTER_NAMESPACE}/{}", filter.virtual_path),
                    name: filter.virtual_path,
                    kind: EntryKind::Filter,
                    size: None,
                    modified_at: Some(filter.updated_at),
                })
                .collect()),
            Resolved::Filter(filter) => {
                let files = self.filters.evaluate_filter(&filter, cancel).await?;
                Ok(files
                    .into_iter()
                    .map(|file| {
                        let path = format!("{}/{}", file.backend_id, file.path);
                        VfsEntry {
                            name: path.clone(),
                            path,
                            kind: EntryKind::File,
                            size: Some(file.size),
                            modified_at: Some(file.modified_at),
                        }
                    })
                    .collect())
            }
            Resolved::Backend { backend, path } => self.list_backend(&backend, &path).await,
        }
    }

    async fn list_backend(
        &self,
        backend: &BackendRecord,
        path: &str,
    ) -> Result<Vec<VfsEntry>, VfsError> {
        let own = if path.is_empty() {
            None
        } else {
            self.store.get_file(&backend.id, path).await?
        };
        if let Some(file) = &own
            && !file.is_dir
        {
            return Ok(vec![file_entry(backend, file, leaf_name(&file.path))]);
        }

        let prefix = dir_prefix(path);
        let files = self
            .store
            .list_files(&backend.id, &prefix, NO_LIMIT, 0)
            .await?;
        if files.is_empty() && own.is_none() && !path.is_empty() {
            return Err(VfsError::NotFound(format!("{}/{path}", backend.id)));
        }

        let mut children: BTreeMap<String, VfsEntry> = BTreeMap::new();
        for file in &files {
            let rest = &file.path[prefix.len()..];
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.entry(dir.to_string()).or_insert_with(|| VfsEntry {
                        name: dir.to_string(),
                        path: format!("{}/{prefix}{dir}", backend.id),
                        kind: EntryKind::Directory,
                        size: None,
                        modified_at: None,
                    });
                }
                None if !rest.is_empty() => {
                    children.insert(rest.to_string(), file_entry(backend, file, rest));
                }
                None => {}
            }
        }
        Ok(children.into_values().collect())
    }

    /// Whether a virtual path names something. Unknown backends and filters
    /// are reported as absent; malformed paths are errors.
    pub async fn exists(&self, path: &str) -> Result<bool, VfsError> {
        match self.resolver().resolve(path).await {
            Ok(Resolved::Backend { backend, path }) => {
                if path.is_empty() || self.store.get_file(&backend.id, &path).await?.is_some() {
                    return Ok(true);
                }
                Ok(self.store.count_files(&backend.id, &dir_prefix(&path)).await? > 0)
            }
            Ok(_) => Ok(true),
            Err(ResolveError::BackendNotFound(_) | ResolveError::FilterNotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Updates the metadata of an object to "modified now", creating an empty
    /// object first when it does not exist.
    pub async fn touch(&self, path: &str) -> Result<FileRecord, VfsError> {
        let (backend, key) = self.object_target(path).await?;
        let existing = self.store.get_file(&backend.id, &key).await?;
        if existing.as_ref().is_some_and(|file| file.is_dir) {
            return Err(VfsError::Validation(format!(
                "'{}/{key}' is a directory",
                backend.id
            )));
        }
        let client = self.registry.resolve_client(&backend.id).await?;
        let info = match client.head(&key).await? {
            Some(info) => info,
            None => client.put(&key, Vec::new()).await?,
        };
        let outcome = self
            .store
            .upsert_file_logged(
                &FileInput {
                    backend_id: backend.id.clone(),
                    path: key,
                    size: info.size,
                    md5: info.etag.clone().filter(|etag| is_md5_hex(etag)),
                    sha256: existing.and_then(|file| file.sha256),
                    etag: info.etag,
                    modified_at: now_unix(),
                    is_dir: false,
                },
                &self.client_id,
            )
            .await?;
        debug!(backend = %backend.id, path = %outcome.file.path, "touched");
        Ok(outcome.file)
    }

    /// Creates a directory and any missing ancestors: a `prefix/` marker
    /// object plus a directory row for each.
    pub async fn mkdir(&self, path: &str) -> Result<FileRecord, VfsError> {
        let (backend, key) = self.object_target(path).await?;
        let client = self.registry.resolve_client(&backend.id).await?;
        let parts = segments(&key);
        let mut created = None;
        for depth in 1..=parts.len() {
            let dir = parts[..depth].join("/");
            if let Some(file) = self.store.get_file(&backend.id, &dir).await? {
                if !file.is_dir {
                    return Err(VfsError::Validation(format!(
                        "'{}/{dir}' already exists as a file",
                        backend.id
                    )));
                }
                created = Some(file);
                continue;
            }
            client.put(&format!("{dir}/"), Vec::new()).await?;
            let outcome = self
                .store
                .upsert_file_logged(
                    &FileInput {
                        backend_id: backend.id.clone(),
                        path: dir,
                        size: 0,
                        md5: None,
                        sha256: None,
                        etag: None,
                        modified_at: now_unix(),
                        is_dir: true,
                    },
                    &self.client_id,
                )
                .await?;
            created = Some(outcome.file);
        }
        created.ok_or_else(|| VfsError::InvalidPath {
            segment: path.to_string(),
            reason: "path does not name an object",
        })
    }

    /// Removes an object, or a directory with `recursive`. A bare backend path
    /// wipes every object of the backend and requires `confirm`; the backend
    /// registration itself is kept. Returns the number of catalog rows removed.
    pub async fn remove(&self, path: &str, options: RemoveOptions) -> Result<u64, VfsError> {
        let (backend, key) = self.resolver().resolve_backend_path(path).await?;
        let client = self.registry.resolve_client(&backend.id).await?;

        if key.is_empty() {
            if !options.confirm {
                return Err(VfsError::ConfirmationRequired(backend.id));
            }
            let removed = self.remove_prefix(client.as_ref(), &backend.id, "").await?;
            self.store.refresh_backend_stats(&backend.id).await?;
            warn!(backend = %backend.id, removed, "backend wiped");
            return Ok(removed);
        }
        validate_object_path(&key)?;

        let own = self.store.get_file(&backend.id, &key).await?;
        if let Some(file) = &own
            && !file.is_dir
        {
            delete_object(client.as_ref(), &key).await?;
            self.store.delete_file_logged(file.id, &self.client_id).await?;
            info!(backend = %backend.id, path = %key, "removed");
            return Ok(1);
        }

        let prefix = dir_prefix(&key);
        let children = self.store.count_files(&backend.id, &prefix).await?;
        if own.is_none() && children == 0 {
            // known to the storage but never scanned into the catalog
            if client.head(&key).await?.is_some() {
                delete_object(client.as_ref(), &key).await?;
                self.store
                    .append_change(
                        None,
                        &backend.id,
                        &key,
                        ChangeKind::Delete,
                        &self.client_id,
                        None,
                    )
                    .await?;
                return Ok(0);
            }
            return Err(VfsError::NotFound(format!("{}/{key}", backend.id)));
        }
        if children > 0 && !options.recursive {
            return Err(VfsError::NotEmpty(format!("{}/{key}", backend.id)));
        }

        let mut removed = self
            .remove_prefix(client.as_ref(), &backend.id, &prefix)
            .await?;
        if let Some(dir) = own
            && self.store.delete_file_logged(dir.id, &self.client_id).await?
        {
            removed += 1;
        }
        info!(backend = %backend.id, path = %key, removed, "removed recursively");
        Ok(removed)
    }

    async fn remove_prefix(
        &self,
        client: &dyn ObjectStore,
        backend_id: &str,
        prefix: &str,
    ) -> Result<u64, VfsError> {
        for object in client.list(prefix).await? {
            delete_object(client, &object.key).await?;
        }
        Ok(self
            .store
            .delete_prefix_logged(backend_id, prefix, &self.client_id)
            .await?)
    }

    /// Lists every physical object of a backend and reconciles the catalog:
    /// new and changed objects are upserted, rows without an object are
    /// soft-deleted. Changes are logged under `scan:<client>`.
    pub async fn scan_backend(&self, backend_id: &str) -> Result<ScanReport, VfsError> {
        let backend = self.registry.get(backend_id).await?;
        let client = self.registry.resolve_client(&backend.id).await?;
        let origin = format!("scan:{}", self.client_id);
        let mut objects = client.list("").await?;
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        let mut report = ScanReport {
            backend_id: backend.id.clone(),
            scanned: 0,
            created: 0,
            updated: 0,
            removed: 0,
        };
        let mut seen = HashSet::new();
        for object in objects {
            let Some(input) = self.scanned_input(&backend.id, object).await? else {
                continue;
            };
            report.scanned += 1;
            seen.insert(input.path.clone());
            let outcome = self.store.upsert_file_logged(&input, &origin).await?;
            match outcome.change {
                Some(ChangeKind::Create) => report.created += 1,
                Some(ChangeKind::Update) => report.updated += 1,
                _ => {}
            }
        }

        for file in self
            .store
            .list_files(&backend.id, "", NO_LIMIT, 0)
            .await?
            .into_iter()
            .filter(|file| !seen.contains(&file.path))
        {
            if self.store.delete_file_logged(file.id, &origin).await? {
                report.removed += 1;
            }
        }

        let (file_count, total_bytes) = self.store.refresh_backend_stats(&backend.id).await?;
        info!(
            backend = %backend.id,
            scanned = report.scanned,
            created = report.created,
            updated = report.updated,
            removed = report.removed,
            file_count,
            total_bytes,
            "backend scanned"
        );
        Ok(report)
    }

    async fn scanned_input(
        &self,
        backend_id: &str,
        object: ObjectInfo,
    ) -> Result<Option<FileInput>, VfsError> {
        let (path, is_dir) = match object.key.strip_suffix('/') {
            Some(dir) => (dir.to_string(), true),
            None => (object.key.clone(), object.is_dir),
        };
        if path.is_empty() || validate_object_path(&path).is_err() {
            warn!(backend = %backend_id, key = %object.key, "skipping object with an unusable key");
            return Ok(None);
        }
        let existing = self.store.get_file(backend_id, &path).await?;
        let modified_at = object
            .modified
            .or_else(|| existing.as_ref().map(|file| file.modified_at))
            .unwrap_or_else(now_unix);
        if is_dir {
            return Ok(Some(FileInput {
                backend_id: backend_id.to_string(),
                path,
                size: 0,
                md5: None,
                sha256: None,
                etag: None,
                modified_at: existing.map_or(modified_at, |file| file.modified_at),
                is_dir: true,
            }));
        }
        // a sha256 computed earlier stays valid while the etag is unchanged
        let sha256 = existing
            .filter(|file| file.etag == object.etag)
            .and_then(|file| file.sha256);
        Ok(Some(FileInput {
            backend_id: backend_id.to_string(),
            path,
            size: object.size,
            md5: object.etag.clone().filter(|etag| is_md5_hex(etag)),
            sha256,
            etag: object.etag,
            modified_at,
            is_dir: false,
        }))
    }

    /// Adds `key=value` to a file. Returns `false` if the tag was already there.
    pub async fn tag_add(&self, path: &str, key: &str, value: &str) -> Result<bool, VfsError> {
        validate_tag(key, value)?;
        let file = self.file_at(path).await?;
        let added = self.store.add_tag(file.id, key, value).await?;
        debug!(backend = %file.backend_id, path = %file.path, key, value, added, "tag added");
        Ok(added)
    }

    pub async fn tag_list(&self, path: &str) -> Result<Vec<TagRecord>, VfsError> {
        let file = self.file_at(path).await?;
        Ok(self.store.get_file_tags(file.id).await?)
    }

    /// Removes `key=value`, or every value of `key` when `value` is `None`.
    /// Removing an absent tag is not an error.
    pub async fn tag_remove(
        &self,
        path: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<u64, VfsError> {
        let file = self.file_at(path).await?;
        let removed = self.store.remove_tag(file.id, key, value).await?;
        debug!(backend = %file.backend_id, path = %file.path, key, removed, "tags removed");
        Ok(removed)
    }

    /// Active files carrying `key=value`, or any value of `key`, ordered by
    /// (backend, path).
    pub async fn tag_search(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<FileRecord>, VfsError> {
        if let Some(value) = value {
            return Ok(self.store.files_by_tag(key, value, NO_LIMIT, 0).await?);
        }
        let ids: HashSet<i64> = self
            .store
            .tag_values_for_key(key)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .list_active_files()
            .await?
            .into_iter()
            .filter(|file| ids.contains(&file.id))
            .collect())
    }

    /// Derives `mime`, `ext` and `year` tags for a file, or for every file
    /// under a directory or backend path.
    pub async fn auto_tag(&self, path: &str) -> Result<AutoTagReport, VfsError> {
        let (backend, key) = self.resolver().resolve_backend_path(path).await?;
        let own = if key.is_empty() {
            None
        } else {
            self.store.get_file(&backend.id, &key).await?
        };
        let known = own.is_some();
        let files = match own {
            Some(file) if !file.is_dir => vec![file],
            _ => self
                .store
                .list_files(&backend.id, &dir_prefix(&key), NO_LIMIT, 0)
                .await?
                .into_iter()
                .filter(|file| !file.is_dir)
                .collect(),
        };
        if files.is_empty() && !key.is_empty() && !known {
            return Err(VfsError::NotFound(format!("{}/{key}", backend.id)));
        }

        let mut report = AutoTagReport::default();
        for file in &files {
            report.files += 1;
            for (tag_key, tag_value) in derived_tags(file) {
                if self.store.add_tag(file.id, tag_key, &tag_value).await? {
                    report.added += 1;
                }
            }
        }
        info!(backend = %backend.id, path = %key, files = report.files, added = report.added, "auto-tagged");
        Ok(report)
    }

    async fn file_at(&self, path: &str) -> Result<FileRecord, VfsError> {
        let (backend, key) = self.object_target(path).await?;
        self.store
            .get_file(&backend.id, &key)
            .await?
            .ok_or_else(|| VfsError::NotFound(format!("{}/{key}", backend.id)))
    }

    /// A backend path that names an object below the backend root.
    async fn object_target(&self, path: &str) -> Result<(BackendRecord, String), VfsError> {
        let (backend, key) = self.resolver().resolve_backend_path(path).await?;
        if key.is_empty() {
            return Err(VfsError::InvalidPath {
                segment: backend.id,
                reason: "path names a backend, not an object",
            });
        }
        validate_object_path(&key)?;
        Ok((backend, key))
    }
}

async fn delete_object(client: &dyn ObjectStore, key: &str) -> Result<(), StorageError> {
    match client.delete(key).await {
        Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

fn file_entry(backend: &BackendRecord, file: &FileRecord, name: &str) -> VfsEntry {
    VfsEntry {
        name: name.to_string(),
        path: format!("{}/{}", backend.id, file.path),
        kind: if file.is_dir {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: (!file.is_dir).then_some(file.size),
        modified_at: Some(file.modified_at),
    }
}

fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dir_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

fn validate_object_path(path: &str) -> Result<(), VfsError> {
    for segment in segments(path) {
        if segment == "." || segment == ".." {
            return Err(VfsError::InvalidPath {
                segment: segment.to_string(),
                reason: "relative segments are not allowed",
            });
        }
    }
    Ok(())
}

fn validate_tag(key: &str, value: &str) -> Result<(), VfsError> {
    if key.is_empty() {
        return Err(VfsError::Validation("tag key is empty".into()));
    }
    if let Some(bad) = key
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '=' | '<' | '>' | '(' | ')' | '"'))
    {
        return Err(VfsError::Validation(format!(
            "tag key '{key}' contains '{bad}'"
        )));
    }
    if value.is_empty() {
        return Err(VfsError::Validation(format!("tag '{key}' has an empty value")));
    }
    Ok(())
}

/// Tags derivable from a file's own metadata.
fn derived_tags(file: &FileRecord) -> Vec<(&'static str, String)> {
    let mime = mime_guess::from_path(&file.path)
        .first_raw()
        .unwrap_or(UNKNOWN_MIME);
    let mut tags = vec![("mime", mime.to_string())];
    if let Some(ext) = Path::new(leaf_name(&file.path))
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
    {
        tags.push(("ext", ext.to_ascii_lowercase()));
    }
    if let Ok(modified) = time::OffsetDateTime::from_unix_timestamp(file.modified_at) {
        tags.push(("year", modified.year().to_string()));
    }
    tags
}

#[cfg(test)]
#[path = "vfs_tests.rs"]
mod tests;
