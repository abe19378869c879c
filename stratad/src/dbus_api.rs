//! D-Bus control surface. Payloads travel as JSON strings of the view types in
//! `strata_integrations`; failures carry `"<error-name>: <message>"`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use strata_core::{ConnectionInfo, Credentials};
use strata_integrations::ids::FILTER_NAMESPACE;
use strata_integrations::{
    BackendUpdateRequest, BackendView, ConflictView, FileView, FilterRequest, FilterView,
    NewBackendRequest, SyncConfigRequest, SyncConfigView, SyncStateView, SyncStatusView, TagView,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zbus::interface;

use crate::daemon::AgentServices;
use crate::error::CoreError;
use crate::filter::{FilterError, FilterSpec};
use crate::registry::{BackendPatch, BackendSpec};
use crate::store::{
    BackendRecord, ConflictRecord, FileRecord, FilterRecord, SyncConfigRecord, SyncDirection,
    SyncPhase, SyncStateRecord,
};
use crate::sync::{SupervisorStatus, SyncSpec};
use crate::vfs::RemoveOptions;

fn map_to_fdo(err: impl Into<CoreError>) -> zbus::fdo::Error {
    let err = err.into();
    zbus::fdo::Error::Failed(format!("{}: {}", err.dbus_error_name(), err))
}

fn parse_request<T: DeserializeOwned>(payload: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(payload)
        .map_err(|err| map_to_fdo(CoreError::Validation(format!("invalid request: {err}"))))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|err| zbus::fdo::Error::Failed(format!("failed to encode reply: {err}")))
}

/// Runs a cancellable read, cancelling it once `timeout` elapses.
async fn with_deadline<T, F, Fut>(timeout: Duration, op: F) -> Result<T, CoreError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let cancel = CancellationToken::new();
    match tokio::time::timeout(timeout, op(cancel.clone())).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(FilterError::TimedOut(timeout).into())
        }
    }
}

/// Empty strings stand for "absent" in optional D-Bus arguments.
fn optional(value: &str) -> Option<&str> {
    Some(value).filter(|value| !value.is_empty())
}

pub struct ControlDbusService {
    services: Arc<AgentServices>,
    eval_timeout: Duration,
}

impl ControlDbusService {
    pub fn new(services: Arc<AgentServices>, eval_timeout: Duration) -> Self {
        Self {
            services,
            eval_timeout,
        }
    }

    async fn current_status(&self) -> Result<SyncStatusView, CoreError> {
        let status = self.services.supervisor.status().await?;
        Ok(status_view(status))
    }
}

#[interface(name = "io.strata.Control1")]
impl ControlDbusService {
    async fn get_status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.current_status().await.map_err(map_to_fdo)?)
    }

    async fn list_syncs(&self) -> zbus::fdo::Result<String> {
        let configs = self
            .services
            .supervisor
            .engine()
            .list_configs()
            .await
            .map_err(map_to_fdo)?;
        to_json(&configs.into_iter().map(config_view).collect::<Vec<_>>())
    }

    async fn create_sync(&self, request: &str) -> zbus::fdo::Result<String> {
        let request: SyncConfigRequest = parse_request(request)?;
        let direction = SyncDirection::parse(&request.direction).map_err(|_| {
            map_to_fdo(CoreError::Validation(format!(
                "unknown direction '{}'; expected upload-only, download-only or bidirectional",
                request.direction
            )))
        })?;
        info!(name = %request.name, source = %request.source, destination = %request.destination, "dbus CreateSync");
        let config = self
            .services
            .supervisor
            .create(SyncSpec {
                name: request.name,
                source: request.source,
                destination: request.destination,
                direction,
                workers: request.workers,
                chunk_size: request.chunk_size,
                interval_secs: request.interval_secs,
                ignore_patterns: request.ignore_patterns,
            })
            .await
            .map_err(map_to_fdo)?;
        to_json(&config_view(config))
    }

    async fn pause_sync(&self, name: &str) -> zbus::fdo::Result<()> {
        info!(name, "dbus PauseSync");
        self.services
            .supervisor
            .pause(name)
            .await
            .map_err(map_to_fdo)?;
        Ok(())
    }

    async fn resume_sync(&self, name: &str) -> zbus::fdo::Result<()> {
        info!(name, "dbus ResumeSync");
        self.services
            .supervisor
            .resume(name)
            .await
            .map_err(map_to_fdo)?;
        Ok(())
    }

    async fn remove_sync(&self, name: &str) -> zbus::fdo::Result<()> {
        info!(name, "dbus RemoveSync");
        self.services
            .supervisor
            .remove(name)
            .await
            .map_err(map_to_fdo)?;
        Ok(())
    }

    /// Asks the supervisor to run a config at its next wake-up.
    async fn run_sync(&self, name: &str) -> zbus::fdo::Result<()> {
        let supervisor = &self.services.supervisor;
        let config = supervisor
            .engine()
            .get_config(name)
            .await
            .map_err(map_to_fdo)?;
        supervisor.request_run(config.id);
        Ok(())
    }

    /// Conflicts of one config, or of every config for an empty name.
    async fn list_conflicts(&self, name: &str) -> zbus::fdo::Result<String> {
        let engine = self.services.supervisor.engine();
        let configs = engine.list_configs().await.map_err(map_to_fdo)?;
        let conflicts = engine
            .conflicts(optional(name))
            .await
            .map_err(map_to_fdo)?;
        let views: Vec<ConflictView> = conflicts
            .into_iter()
            .map(|conflict| {
                let config = configs
                    .iter()
                    .find(|config| config.id == conflict.sync_config_id)
                    .map(|config| config.name.clone())
                    .unwrap_or_default();
                conflict_view(config, conflict)
            })
            .collect();
        to_json(&views)
    }

    async fn provision_backend(&self, request: &str) -> zbus::fdo::Result<String> {
        let request: NewBackendRequest = parse_request(request)?;
        info!(backend = %request.id, endpoint = %request.endpoint, "dbus ProvisionBackend");
        let record = self
            .services
            .registry
            .register(BackendSpec {
                id: request.id,
                name: request.name,
                connection: ConnectionInfo {
                    endpoint: request.endpoint,
                    region: request.region,
                    bucket: request.bucket,
                    use_ssl: request.use_ssl,
                },
                credentials: Credentials {
                    access_key: request.access_key,
                    secret_key: request.secret_key,
                },
            })
            .await
            .map_err(map_to_fdo)?;
        to_json(&backend_view(&record))
    }

    async fn list_backends(&self) -> zbus::fdo::Result<String> {
        let backends = self.services.registry.list().await.map_err(map_to_fdo)?;
        to_json(&backends.iter().map(backend_view).collect::<Vec<_>>())
    }

    async fn show_backend(&self, id: &str) -> zbus::fdo::Result<String> {
        let record = self.services.registry.get(id).await.map_err(map_to_fdo)?;
        to_json(&backend_view(&record))
    }

    async fn update_backend(&self, id: &str, request: &str) -> zbus::fdo::Result<String> {
        let request: BackendUpdateRequest = parse_request(request)?;
        info!(backend = id, "dbus UpdateBackend");
        let record = self
            .services
            .registry
            .update(
                id,
                BackendPatch {
                    name: request.name,
                    endpoint: request.endpoint,
                    region: request.region,
                    bucket: request.bucket,
                    use_ssl: request.use_ssl,
                    access_key: request.access_key,
                    secret_key: request.secret_key,
                },
            )
            .await
            .map_err(map_to_fdo)?;
        to_json(&backend_view(&record))
    }

    async fn remove_backend(&self, id: &str) -> zbus::fdo::Result<()> {
        info!(backend = id, "dbus RemoveBackend");
        self.services.registry.remove(id).await.map_err(map_to_fdo)
    }

    async fn scan_backend(&self, id: &str) -> zbus::fdo::Result<String> {
        info!(backend = id, "dbus ScanBackend");
        let report = self
            .services
            .vfs
            .scan_backend(id)
            .await
            .map_err(map_to_fdo)?;
        to_json(&report)
    }

    async fn create_filter(&self, request: &str) -> zbus::fdo::Result<String> {
        let request: FilterRequest = parse_request(request)?;
        let record = self
            .services
            .filters
            .create_filter(filter_spec(request))
            .await
            .map_err(map_to_fdo)?;
        to_json(&filter_view(record))
    }

    async fn list_filters(&self) -> zbus::fdo::Result<String> {
        let filters = self
            .services
            .filters
            .list_filters()
            .await
            .map_err(map_to_fdo)?;
        to_json(&filters.into_iter().map(filter_view).collect::<Vec<_>>())
    }

    async fn show_filter(&self, path: &str) -> zbus::fdo::Result<String> {
        let record = self
            .services
            .filters
            .get_filter(path)
            .await
            .map_err(map_to_fdo)?;
        to_json(&filter_view(record))
    }

    async fn update_filter(&self, path: &str, request: &str) -> zbus::fdo::Result<String> {
        let request: FilterRequest = parse_request(request)?;
        let record = self
            .services
            .filters
            .update_filter(path, filter_spec(request))
            .await
            .map_err(map_to_fdo)?;
        to_json(&filter_view(record))
    }

    async fn delete_filter(&self, path: &str) -> zbus::fdo::Result<()> {
        self.services
            .filters
            .delete_filter(path)
            .await
            .map_err(map_to_fdo)
    }

    /// Evaluates a query without storing it.
    async fn test_filter(&self, query: &str) -> zbus::fdo::Result<String> {
        debug!(query, "dbus TestFilter");
        let filters = &self.services.filters;
        let files = with_deadline(self.eval_timeout, |cancel| async move {
            filters
                .evaluate_query(query, &cancel)
                .await
                .map_err(CoreError::from)
        })
        .await
        .map_err(map_to_fdo)?;
        to_json(&files.into_iter().map(file_view).collect::<Vec<_>>())
    }
}

pub struct VfsDbusService {
    services: Arc<AgentServices>,
    eval_timeout: Duration,
}

impl VfsDbusService {
    pub fn new(services: Arc<AgentServices>, eval_timeout: Duration) -> Self {
        Self {
            services,
            eval_timeout,
        }
    }
}

#[interface(name = "io.strata.Vfs1")]
impl VfsDbusService {
    async fn list(&self, path: &str) -> zbus::fdo::Result<String> {
        let vfs = &self.services.vfs;
        let entries = with_deadline(self.eval_timeout, |cancel| async move {
            vfs.list(path, &cancel).await.map_err(CoreError::from)
        })
        .await
        .map_err(map_to_fdo)?;
        to_json(&entries)
    }

    async fn exists(&self, path: &str) -> zbus::fdo::Result<bool> {
        self.services.vfs.exists(path).await.map_err(map_to_fdo)
    }

    async fn touch(&self, path: &str) -> zbus::fdo::Result<String> {
        let file = self.services.vfs.touch(path).await.map_err(map_to_fdo)?;
        to_json(&file_view(file))
    }

    async fn remove(&self, path: &str, recursive: bool, confirm: bool) -> zbus::fdo::Result<u64> {
        info!(path, recursive, confirm, "dbus Remove");
        self.services
            .vfs
            .remove(path, RemoveOptions { recursive, confirm })
            .await
            .map_err(map_to_fdo)
    }

    async fn mkdir(&self, path: &str) -> zbus::fdo::Result<String> {
        let dir = self.services.vfs.mkdir(path).await.map_err(map_to_fdo)?;
        to_json(&file_view(dir))
    }

    async fn tag_add(&self, path: &str, key: &str, value: &str) -> zbus::fdo::Result<bool> {
        self.services
            .vfs
            .tag_add(path, key, value)
            .await
            .map_err(map_to_fdo)
    }

    async fn tag_list(&self, path: &str) -> zbus::fdo::Result<String> {
        let tags = self.services.vfs.tag_list(path).await.map_err(map_to_fdo)?;
        let views: Vec<TagView> = tags
            .into_iter()
            .map(|tag| TagView {
                key: tag.key,
                value: tag.value,
            })
            .collect();
        to_json(&views)
    }

    /// An empty `value` removes every value of `key`.
    async fn tag_remove(&self, path: &str, key: &str, value: &str) -> zbus::fdo::Result<u64> {
        self.services
            .vfs
            .tag_remove(path, key, optional(value))
            .await
            .map_err(map_to_fdo)
    }

    /// An empty `value` matches any value of `key`.
    async fn tag_search(&self, key: &str, value: &str) -> zbus::fdo::Result<String> {
        let files = self
            .services
            .vfs
            .tag_search(key, optional(value))
            .await
            .map_err(map_to_fdo)?;
        to_json(&files.into_iter().map(file_view).collect::<Vec<_>>())
    }

    async fn auto_tag(&self, path: &str) -> zbus::fdo::Result<String> {
        let report = self.services.vfs.auto_tag(path).await.map_err(map_to_fdo)?;
        to_json(&report)
    }
}

fn filter_spec(request: FilterRequest) -> FilterSpec {
    FilterSpec {
        virtual_path: request.virtual_path,
        name: request.name,
        query: request.query,
        description: request.description,
    }
}

fn backend_view(record: &BackendRecord) -> BackendView {
    BackendView {
        id: record.id.clone(),
        name: record.name.clone(),
        endpoint: record.connection.endpoint.clone(),
        region: record.connection.region.clone(),
        bucket: record.connection.bucket.clone(),
        use_ssl: record.connection.use_ssl,
        file_count: record.file_count,
        total_bytes: record.total_bytes,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

fn file_view(file: FileRecord) -> FileView {
    FileView {
        backend_id: file.backend_id,
        path: file.path,
        size: file.size,
        etag: file.etag,
        md5: file.md5,
        sha256: file.sha256,
        modified_at: file.modified_at,
        is_dir: file.is_dir,
    }
}

fn filter_view(record: FilterRecord) -> FilterView {
    FilterView {
        virtual_path: format!("{FILTER_NAMESPACE}/{}", record.virtual_path),
        name: record.name,
        query: record.query,
        description: record.description,
    }
}

fn config_view(config: SyncConfigRecord) -> SyncConfigView {
    SyncConfigView {
        name: config.name,
        source: config.source_path,
        destination: config.dest_path,
        direction: config.direction.as_str().to_string(),
        enabled: config.enabled,
        workers: config.workers,
        chunk_size: config.chunk_size,
        interval_secs: config.interval_secs,
        ignore_patterns: config.ignore_patterns,
    }
}

fn state_view(config: String, state: SyncStateRecord) -> SyncStateView {
    SyncStateView {
        config,
        backend_id: state.backend_id,
        client_id: state.client_id,
        phase: state.phase.as_str().to_string(),
        last_sync_at: state.last_sync_at,
        cursor: state.cursor,
        files_scanned: state.files_scanned,
        files_synced: state.files_synced,
        bytes_synced: state.bytes_synced,
        error_count: state.error_count,
        last_error: state.last_error,
    }
}

fn conflict_view(config: String, conflict: ConflictRecord) -> ConflictView {
    ConflictView {
        config,
        path: conflict.rel_path,
        winner: conflict.winner,
        discarded_size: conflict.discarded_size,
        discarded_mtime: conflict.discarded_mtime,
        reason: conflict.reason,
        created_at: conflict.created_at,
    }
}

fn status_view(status: SupervisorStatus) -> SyncStatusView {
    let errored = status
        .states
        .iter()
        .filter(|state| state.phase == SyncPhase::Error)
        .count();
    let states = status
        .states
        .into_iter()
        .map(|state| {
            let config = status
                .configs
                .iter()
                .find(|config| config.id == state.sync_config_id)
                .map(|config| config.name.clone())
                .unwrap_or_default();
            state_view(config, state)
        })
        .collect();
    SyncStatusView {
        configs: status.configs.len(),
        enabled: status.configs.iter().filter(|config| config.enabled).count(),
        running: status.running.len(),
        errored,
        states,
    }
}

#[cfg(test)]
#[path = "dbus_api_tests.rs"]
mod tests;
