use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::io;
use std::sync::Arc;

use strata_core::{ObjectStore, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineError;
use super::backoff::Backoff;
use super::diff::{DiffInput, LocalItem, RemoteItem, diff};
use super::local::{IgnoreSet, local_path_for, scan_local};
use super::plan::{RemoteEndpoint, SyncPlan};
use super::state::{PhaseEvent, next_phase};
use super::worker::{JobContext, drain, hash_file};
use crate::filter::FilterEngine;
use crate::registry::BackendRegistry;
use crate::resolver::PathResolver;
use crate::store::{
    ConflictInput, ConflictRecord, DEFAULT_CHUNK_SIZE, DEFAULT_INTERVAL_SECS, DEFAULT_WORKERS,
    JobStatus, MetadataStore, NewSyncConfig, SyncConfigRecord, SyncDirection, SyncPhase,
    SyncStateRecord, now_unix,
};

const DEFAULT_JOB_RETRIES: u32 = 3;

/// A sync config as requested by a caller; unset numbers take defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSpec {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub direction: SyncDirection,
    pub workers: Option<u32>,
    pub chunk_size: Option<u64>,
    pub interval_secs: Option<u64>,
    pub ignore_patterns: Vec<String>,
}

/// Totals of one run over every state of a config.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub states: u32,
    pub scanned: i64,
    pub queued: u64,
    /// Jobs picked up from an earlier, interrupted run instead of a new scan.
    pub resumed: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes: i64,
    pub conflicts: u64,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.states += other.states;
        self.scanned += other.scanned;
        self.queued += other.queued;
        self.resumed += other.resumed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.bytes += other.bytes;
        self.conflicts += other.conflicts;
    }
}

/// One backend's share of a config: a whole backend prefix, or the slice of a
/// filter's result that lives on one backend.
struct Target {
    backend_id: String,
    prefix: String,
    /// Prefix of relative paths belonging to this target (`<backend>/` for filters).
    local_prefix: String,
    /// Pre-computed listing for filter targets.
    remote: Option<BTreeMap<String, RemoteItem>>,
}

pub struct SyncEngine {
    store: Arc<MetadataStore>,
    registry: Arc<BackendRegistry>,
    filters: Arc<FilterEngine>,
    client_id: String,
    job_retries: u32,
    job_backoff: Backoff,
}

impl SyncEngine {
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
            job_retries: DEFAULT_JOB_RETRIES,
            job_backoff: Backoff::for_jobs(),
        }
    }

    pub fn with_retries(mut self, retries: u32, backoff: Backoff) -> Self {
        self.job_retries = retries;
        self.job_backoff = backoff;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn create_config(&self, spec: SyncSpec) -> Result<SyncConfigRecord, EngineError> {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::InvalidConfig("name is required".into()));
        }
        let workers = spec.workers.unwrap_or(DEFAULT_WORKERS);
        let chunk_size = spec.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let interval_secs = spec.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);
        if workers == 0 {
            return Err(EngineError::InvalidConfig("workers must be at least 1".into()));
        }
        if chunk_size == 0 {
            return Err(EngineError::InvalidConfig("chunk size must be positive".into()));
        }
        if interval_secs == 0 {
            return Err(EngineError::InvalidConfig("interval must be positive".into()));
        }
        IgnoreSet::new(&spec.ignore_patterns)?;
        SyncPlan::build(
            &PathResolver::new(&self.store),
            &spec.source,
            &spec.destination,
            spec.direction,
        )
        .await?;

        let record = self
            .store
            .create_sync_config(&NewSyncConfig {
                name,
                source_path: spec.source,
                dest_path: spec.destination,
                direction: spec.direction,
                enabled: true,
                interval_secs,
                workers,
                chunk_size,
                ignore_patterns: spec.ignore_patterns,
            })
            .await?;
        info!(config = %record.name, source = %record.source_path, destination = %record.dest_path, direction = record.direction.as_str(), "sync config created");
        Ok(record)
    }

    pub async fn get_config(&self, name: &str) -> Result<SyncConfigRecord, EngineError> {
        self.store
            .get_sync_config(name)
            .await?
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    pub async fn list_configs(&self) -> Result<Vec<SyncConfigRecord>, EngineError> {
        Ok(self.store.list_sync_configs().await?)
    }

    pub async fn remove_config(&self, name: &str) -> Result<(), EngineError> {
        let config = self.get_config(name).await?;
        self.store.delete_sync_config(config.id).await?;
        info!(config = %config.name, "sync config removed");
        Ok(())
    }

    /// Disables the config and parks each of its states in `paused`.
    pub async fn pause_config(
        &self,
        config: &SyncConfigRecord,
    ) -> Result<SyncConfigRecord, EngineError> {
        for state in self.store.list_sync_states(Some(config.id)).await? {
            if state.phase != SyncPhase::Paused {
                self.advance(&state, state.phase, PhaseEvent::Pause).await?;
            }
        }
        let updated = self.set_enabled(config, false).await?;
        info!(config = %config.name, "sync paused");
        Ok(updated)
    }

    pub async fn resume_config(
        &self,
        config: &SyncConfigRecord,
    ) -> Result<SyncConfigRecord, EngineError> {
        for state in self.store.list_sync_states(Some(config.id)).await? {
            if state.phase == SyncPhase::Paused {
                self.advance(&state, state.phase, PhaseEvent::Resume).await?;
            }
        }
        let updated = self.set_enabled(config, true).await?;
        info!(config = %config.name, "sync resumed");
        Ok(updated)
    }

    async fn set_enabled(
        &self,
        config: &SyncConfigRecord,
        enabled: bool,
    ) -> Result<SyncConfigRecord, EngineError> {
        let mut record = config.clone();
        record.enabled = enabled;
        self.store
            .update_sync_config(&record)
            .await?
            .ok_or_else(|| EngineError::NotFound(config.name.clone()))
    }

    pub async fn states(
        &self,
        config_id: Option<i64>,
    ) -> Result<Vec<SyncStateRecord>, EngineError> {
        Ok(self.store.list_sync_states(config_id).await?)
    }

    pub async fn conflicts(&self, name: Option<&str>) -> Result<Vec<ConflictRecord>, EngineError> {
        let config_id = match name {
            Some(name) => Some(self.get_config(name).await?.id),
            None => None,
        };
        Ok(self.store.list_conflicts(config_id).await?)
    }

    /// States a previous process left mid-run move to `error`; their queued
    /// jobs resume once the supervisor recovers them.
    pub async fn mark_interrupted(&self) -> Result<usize, EngineError> {
        let mut marked = 0;
        for state in self.store.list_sync_states(None).await? {
            if matches!(state.phase, SyncPhase::Scanning | SyncPhase::Syncing) {
                next_phase(state.phase, PhaseEvent::Fail)?;
                self.store
                    .record_sync_failure(state.id, "interrupted before completion")
                    .await?;
                warn!(state = state.id, backend = %state.backend_id, phase = state.phase.as_str(), "sync run was interrupted");
                marked += 1;
            }
        }
        Ok(marked)
    }

    pub async fn plan(&self, config: &SyncConfigRecord) -> Result<SyncPlan, EngineError> {
        SyncPlan::for_config(&PathResolver::new(&self.store), config).await
    }

    /// Runs every state of a config once: scan, queue, drain. Paused states
    /// are skipped; a failing state does not stop the others.
    pub async fn run_config(
        &self,
        config: &SyncConfigRecord,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        let plan = self.plan(config).await?;
        let ignore = IgnoreSet::new(&config.ignore_patterns)?;
        let root = plan.local_root.clone();
        let walk_ignore = ignore.clone();
        let local = tokio::task::spawn_blocking(move || scan_local(&root, &walk_ignore))
            .await
            .map_err(|err| EngineError::Io(io::Error::other(err)))??;

        let targets = self.targets(config, &plan, &ignore, cancel).await?;
        let mut summary = RunSummary::default();
        let mut first_error = None;
        for target in targets {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let state = self
                .store
                .get_or_create_sync_state(config.id, &target.backend_id, &self.client_id)
                .await?;
            if state.phase == SyncPhase::Paused {
                debug!(config = %config.name, backend = %state.backend_id, "state paused; skipped");
                continue;
            }
            match self
                .run_target(config, &plan, &ignore, &local, target, state, cancel)
                .await
            {
                Ok(part) => summary.merge(part),
                Err(err) if matches!(err, EngineError::Cancelled) || err.aborts_batch() => {
                    return Err(err);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    async fn targets(
        &self,
        config: &SyncConfigRecord,
        plan: &SyncPlan,
        ignore: &IgnoreSet,
        cancel: &CancellationToken,
    ) -> Result<Vec<Target>, EngineError> {
        match &plan.remote {
            RemoteEndpoint::Backend { backend_id, prefix } => Ok(vec![Target {
                backend_id: backend_id.clone(),
                prefix: prefix.clone(),
                local_prefix: String::new(),
                remote: None,
            }]),
            RemoteEndpoint::Filter(filter) => {
                let files = self.filters.evaluate_filter(filter, cancel).await?;
                let mut grouped: BTreeMap<String, BTreeMap<String, RemoteItem>> = BTreeMap::new();
                // backends synced before keep a target so files that left the
                // filter are removed locally
                for state in self.store.list_sync_states(Some(config.id)).await? {
                    if state.client_id == self.client_id {
                        grouped.entry(state.backend_id).or_default();
                    }
                }
                for file in files {
                    let rel_path = format!("{}/{}", file.backend_id, file.path);
                    if ignore.is_ignored(&rel_path) {
                        continue;
                    }
                    grouped.entry(file.backend_id.clone()).or_default().insert(
                        rel_path,
                        RemoteItem {
                            key: file.path,
                            size: file.size,
                            etag: file.etag.or(file.md5),
                            mtime: Some(file.modified_at),
                        },
                    );
                }
                Ok(grouped
                    .into_iter()
                    .map(|(backend_id, remote)| Target {
                        local_prefix: format!("{backend_id}/"),
                        backend_id,
                        prefix: String::new(),
                        remote: Some(remote),
                    })
                    .collect())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_target(
        &self,
        config: &SyncConfigRecord,
        plan: &SyncPlan,
        ignore: &IgnoreSet,
        local: &BTreeMap<String, LocalItem>,
        target: Target,
        state: SyncStateRecord,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        let mut phase = state.phase;
        if matches!(phase, SyncPhase::Scanning | SyncPhase::Syncing) {
            self.store
                .record_sync_failure(state.id, "interrupted before completion")
                .await?;
            phase = next_phase(phase, PhaseEvent::Fail)?;
        }
        if phase == SyncPhase::Error {
            phase = self.advance(&state, phase, PhaseEvent::Recover).await?;
        }
        let client = match self.registry.resolve_client(&target.backend_id).await {
            Ok(client) => client,
            Err(err) => {
                let err = EngineError::from(err);
                self.fail(&state, phase, &err).await?;
                return Err(err);
            }
        };

        let reset = self.store.reset_running_jobs(state.id).await?;
        let pending = self.store.count_jobs(state.id, JobStatus::Pending).await?;
        phase = self.advance(&state, phase, PhaseEvent::Scan).await?;

        let mut summary = RunSummary {
            states: 1,
            ..RunSummary::default()
        };
        if pending > 0 {
            info!(config = %config.name, backend = %target.backend_id, pending, reset, "resuming queued jobs");
            summary.resumed = pending as u64;
        } else {
            let scanned = self
                .scan(config, plan, ignore, local, &target, &state, client.as_ref(), cancel)
                .await;
            match scanned {
                Ok(part) => summary.merge(part),
                Err(err) => {
                    if !matches!(err, EngineError::Cancelled) && !err.aborts_batch() {
                        self.fail(&state, phase, &err).await?;
                    }
                    return Err(err);
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        phase = self.advance(&state, phase, PhaseEvent::Drain).await?;
        let ctx = Arc::new(JobContext {
            store: self.store.clone(),
            client,
            backend_id: target.backend_id.clone(),
            local_root: plan.local_root.clone(),
            client_id: self.client_id.clone(),
            record_metadata: matches!(plan.remote, RemoteEndpoint::Backend { .. }),
            chunk_size: config.chunk_size,
            retries: self.job_retries,
            backoff: self.job_backoff,
            cancel: cancel.child_token(),
        });
        let tally = drain(ctx, state.id, config.workers).await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.store.clear_finished_jobs(state.id).await?;
        summary.completed = tally.completed;
        summary.failed = tally.failed;
        summary.bytes = tally.bytes;

        if tally.failed > 0 {
            let message = format!(
                "{} of {} jobs failed",
                tally.failed,
                tally.failed + tally.completed
            );
            next_phase(phase, PhaseEvent::Fail)?;
            self.store.record_sync_failure(state.id, &message).await?;
            warn!(config = %config.name, backend = %target.backend_id, failed = tally.failed, "sync run finished with failures");
        } else {
            next_phase(phase, PhaseEvent::Finish)?;
            let cursor = self.store.latest_change_id(&target.backend_id).await?;
            self.store.record_sync_success(state.id, cursor).await?;
            info!(config = %config.name, backend = %target.backend_id, completed = tally.completed, bytes = tally.bytes, "sync run finished");
        }
        Ok(summary)
    }

    /// Compares both sides against the baseline, records conflicts and queues
    /// the resulting jobs.
    #[allow(clippy::too_many_arguments)]
    async fn scan(
        &self,
        config: &SyncConfigRecord,
        plan: &SyncPlan,
        ignore: &IgnoreSet,
        local: &BTreeMap<String, LocalItem>,
        target: &Target,
        state: &SyncStateRecord,
        client: &dyn ObjectStore,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        let local: BTreeMap<String, LocalItem> = local
            .iter()
            .filter(|(rel_path, _)| rel_path.starts_with(&target.local_prefix))
            .map(|(rel_path, item)| (rel_path.clone(), *item))
            .collect();
        let remote = match &target.remote {
            Some(listing) => listing.clone(),
            None => self.list_remote(client, &target.prefix, ignore, cancel).await?,
        };
        let baseline = self
            .store
            .list_sync_entries(state.id)
            .await?
            .into_iter()
            .filter(|entry| !ignore.is_ignored(&entry.rel_path))
            .map(|entry| (entry.rel_path.clone(), entry))
            .collect::<BTreeMap<_, _>>();
        let identical = self
            .identical_paths(plan, &local, &remote, &baseline, config.chunk_size)
            .await?;

        let outcome = diff(&DiffInput {
            local: &local,
            remote: &remote,
            baseline: &baseline,
            identical: &identical,
            direction: config.direction,
            remote_prefix: &target.prefix,
        });

        let mut recorded = 0u64;
        for conflict in &outcome.conflicts {
            let id = self
                .store
                .record_conflict(&ConflictInput {
                    sync_config_id: config.id,
                    rel_path: conflict.rel_path.clone(),
                    winner: conflict.winner.as_str().to_string(),
                    discarded_size: conflict.discarded_size,
                    discarded_mtime: conflict.discarded_mtime,
                    discarded_etag: conflict.discarded_etag.clone(),
                    reason: conflict.reason.clone(),
                })
                .await?;
            if id.is_some() {
                recorded += 1;
                warn!(config = %config.name, path = %conflict.rel_path, winner = conflict.winner.as_str(), reason = %conflict.reason, "sync conflict resolved");
            } else {
                debug!(config = %config.name, path = %conflict.rel_path, "conflict already recorded");
            }
        }
        for (rel_path, update) in &outcome.baseline {
            self.store.set_sync_entry(state.id, rel_path, update).await?;
        }
        let batch = now_unix();
        self.store
            .enqueue_jobs(state.id, batch, &outcome.jobs)
            .await?;
        self.store
            .record_scan(state.id, outcome.scanned, batch)
            .await?;
        debug!(config = %config.name, backend = %target.backend_id, scanned = outcome.scanned, queued = outcome.jobs.len(), "scan complete");

        Ok(RunSummary {
            scanned: outcome.scanned,
            queued: outcome.jobs.len() as u64,
            conflicts: recorded,
            ..RunSummary::default()
        })
    }

    async fn list_remote(
        &self,
        client: &dyn ObjectStore,
        prefix: &str,
        ignore: &IgnoreSet,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, RemoteItem>, EngineError> {
        let list_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };
        let objects = self
            .retrying(cancel, || client.list(&list_prefix))
            .await?;
        Ok(objects
            .into_iter()
            .filter(|object| !object.is_dir)
            .filter_map(|object| {
                let rel_path = object.key.strip_prefix(&list_prefix)?.to_string();
                if rel_path.is_empty() || ignore.is_ignored(&rel_path) {
                    return None;
                }
                Some((
                    rel_path,
                    RemoteItem {
                        key: object.key,
                        size: object.size,
                        etag: object.etag,
                        mtime: object.modified,
                    },
                ))
            })
            .collect())
    }

    /// New paths present on both sides whose local md5 equals the remote etag.
    async fn identical_paths(
        &self,
        plan: &SyncPlan,
        local: &BTreeMap<String, LocalItem>,
        remote: &BTreeMap<String, RemoteItem>,
        baseline: &BTreeMap<String, crate::store::SyncEntryRecord>,
        chunk_size: u64,
    ) -> Result<HashSet<String>, EngineError> {
        let candidates: BTreeSet<&String> = local
            .iter()
            .filter(|(rel_path, item)| {
                !baseline.contains_key(*rel_path)
                    && remote
                        .get(*rel_path)
                        .is_some_and(|remote| remote.size == item.size && remote.etag.is_some())
            })
            .map(|(rel_path, _)| rel_path)
            .collect();
        let mut identical = HashSet::new();
        for rel_path in candidates {
            let path = local_path_for(&plan.local_root, rel_path)?;
            let digest = hash_file(&path, chunk_size).await?;
            if remote[rel_path].etag.as_deref() == Some(digest.as_str()) {
                identical.insert(rel_path.clone());
            }
        }
        Ok(identical)
    }

    async fn retrying<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < self.job_retries => {
                    let delay = self.job_backoff.delay(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying storage request");
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return Ok(other?),
            }
        }
    }

    async fn advance(
        &self,
        state: &SyncStateRecord,
        from: SyncPhase,
        event: PhaseEvent,
    ) -> Result<SyncPhase, EngineError> {
        let to = next_phase(from, event)?;
        self.store.set_sync_phase(state.id, to).await?;
        debug!(state = state.id, from = from.as_str(), to = to.as_str(), "sync phase");
        Ok(to)
    }

    async fn fail(
        &self,
        state: &SyncStateRecord,
        from: SyncPhase,
        err: &EngineError,
    ) -> Result<(), EngineError> {
        next_phase(from, PhaseEvent::Fail)?;
        self.store
            .record_sync_failure(state.id, &err.to_string())
            .await?;
        warn!(state = state.id, backend = %state.backend_id, error = %err, "sync run failed");
        Ok(())
    }
}
